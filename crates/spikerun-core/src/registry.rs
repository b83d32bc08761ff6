//! Sorter registry: the named collection of available sorter adapters.
//!
//! Lookups go through [`SorterRegistry::adapter`], which turns an unknown
//! name into [`SortError::UnknownSorter`]. Installation status is probed
//! once when an adapter is registered and again only on
//! [`SorterRegistry::refresh`] or [`SorterRegistry::set_install_path`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use spikerun_data::{Recording, Sorting};

use crate::error::{Result, SortError};
use crate::executor::{ScriptExecutor, ShellExecutor};
use crate::params::{ParamSet, ParamValue};
use crate::runner::{self, RunOptions, RunResult};
use crate::settings::{SorterSettings, install_env_var};
use crate::sorter::{SorterAdapter, SorterDescriptor, SorterKind, SorterRef};

/// A collection of registered [`SorterAdapter`]s, keyed by name.
///
/// # Example
///
/// ```ignore
/// let registry = SorterRegistry::with_builtin(SorterSettings::from_env());
/// assert_eq!(registry.available(), vec!["hdsort"]);
/// ```
pub struct SorterRegistry {
    adapters: BTreeMap<String, Arc<dyn SorterAdapter>>,
    installed: BTreeSet<String>,
    settings: Arc<SorterSettings>,
    executor: Arc<dyn ScriptExecutor>,
}

impl SorterRegistry {
    /// An empty registry that runs scripts with [`ShellExecutor`].
    pub fn new(settings: SorterSettings) -> Self {
        Self {
            adapters: BTreeMap::new(),
            installed: BTreeSet::new(),
            settings: Arc::new(settings),
            executor: Arc::new(ShellExecutor),
        }
    }

    /// A registry holding every built-in sorter.
    pub fn with_builtin(settings: SorterSettings) -> Self {
        let mut registry = Self::new(settings);
        for kind in SorterKind::ALL {
            registry.register_arc(kind.adapter());
        }
        registry
    }

    /// Replace the script executor (tests substitute a fake tool here).
    pub fn with_executor(mut self, executor: Arc<dyn ScriptExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Register an adapter under [`SorterAdapter::name`].
    ///
    /// An adapter already registered under that name is replaced and
    /// returned.
    pub fn register(&mut self, adapter: impl SorterAdapter + 'static) -> Option<Arc<dyn SorterAdapter>> {
        self.register_arc(Arc::new(adapter))
    }

    fn register_arc(&mut self, adapter: Arc<dyn SorterAdapter>) -> Option<Arc<dyn SorterAdapter>> {
        let name = adapter.name().to_string();
        if adapter.is_installed(&self.settings) {
            self.installed.insert(name.clone());
        } else {
            self.installed.remove(&name);
        }
        tracing::debug!(sorter = %name, installed = self.installed.contains(&name), "registered sorter");
        self.adapters.insert(name, adapter)
    }

    /// Look up an adapter.
    pub fn adapter(&self, sorter: impl Into<SorterRef>) -> Result<Arc<dyn SorterAdapter>> {
        let sorter = sorter.into();
        self.adapters
            .get(sorter.name())
            .cloned()
            .ok_or_else(|| SortError::UnknownSorter {
                name: sorter.name().to_string(),
                available: self.available().into_iter().map(String::from).collect(),
            })
    }

    /// Names of every registered sorter, sorted and unique.
    pub fn available(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    /// Names of the registered sorters that passed their installation probe.
    pub fn installed(&self) -> Vec<&str> {
        self.installed.iter().map(String::as_str).collect()
    }

    pub fn is_installed(&self, sorter: &str) -> bool {
        self.installed.contains(sorter)
    }

    /// Re-probe every adapter.
    pub fn refresh(&mut self) {
        let settings = Arc::clone(&self.settings);
        self.installed = self
            .adapters
            .iter()
            .filter(|(_, adapter)| adapter.is_installed(&settings))
            .map(|(name, _)| name.clone())
            .collect();
    }

    /// Point a sorter at a new install root and re-probe it.
    ///
    /// The path reaches child processes as `<TOOL>_PATH`; the parent's
    /// environment is left alone. Returns whether the sorter is now
    /// installed.
    pub fn set_install_path(&mut self, sorter: &str, path: impl Into<String>) -> Result<bool> {
        let adapter = self.adapter(sorter)?;
        let path = path.into();
        tracing::info!(
            sorter = %sorter,
            path = %path,
            "setting {} for subprocess calls",
            install_env_var(sorter)
        );
        Arc::make_mut(&mut self.settings).set_install_path(sorter, path);

        let installed = adapter.is_installed(&self.settings);
        if installed {
            self.installed.insert(sorter.to_string());
        } else {
            self.installed.remove(sorter);
        }
        Ok(installed)
    }

    pub fn settings(&self) -> &SorterSettings {
        &self.settings
    }

    pub(crate) fn shared_settings(&self) -> Arc<SorterSettings> {
        Arc::clone(&self.settings)
    }

    pub(crate) fn executor(&self) -> Arc<dyn ScriptExecutor> {
        Arc::clone(&self.executor)
    }

    /// The default parameter set of a sorter.
    pub fn default_params(&self, sorter: impl Into<SorterRef>) -> Result<ParamSet> {
        Ok(ParamSet::defaults(self.adapter(sorter)?.param_table()))
    }

    pub fn descriptor(&self, sorter: impl Into<SorterRef>) -> Result<SorterDescriptor> {
        Ok(self.adapter(sorter)?.descriptor(&self.settings))
    }

    /// `(name, version)` for every installed sorter, in name order.
    pub fn versions(&self) -> Vec<(String, String)> {
        self.installed
            .iter()
            .filter_map(|name| self.adapters.get(name))
            .map(|adapter| (adapter.name().to_string(), adapter.version(&self.settings)))
            .collect()
    }

    /// One `name: version` line per installed sorter, without a trailing
    /// newline.
    pub fn format_versions(&self) -> String {
        self.versions()
            .iter()
            .map(|(name, version)| format!("{name}: {version}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Run a sorter on `recording`. See [`runner::run_sorter`].
    pub async fn run<I, K, V>(
        &self,
        sorter: impl Into<SorterRef>,
        recording: Arc<dyn Recording>,
        options: RunOptions,
        params: I,
    ) -> Result<RunResult>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<ParamValue>,
    {
        runner::run_sorter(self, sorter, recording, options, params).await
    }

    /// Parse a finished run's output folder.
    pub fn get_result(&self, sorter: impl Into<SorterRef>, output_folder: &Path) -> Result<Sorting> {
        self.adapter(sorter)?.parse(output_folder)
    }
}

impl std::fmt::Debug for SorterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SorterRegistry")
            .field("adapters", &self.adapters.keys().collect::<Vec<_>>())
            .field("installed", &self.installed)
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamSpec, ParamTable};
    use crate::sorter::{RenderedScript, SortJob};
    use async_trait::async_trait;

    /// Minimal adapter whose installation state is fixed at construction.
    struct FakeSorter {
        sorter_name: String,
        installed: bool,
    }

    impl FakeSorter {
        fn new(name: &str, installed: bool) -> Self {
            Self {
                sorter_name: name.to_string(),
                installed,
            }
        }
    }

    #[async_trait]
    impl SorterAdapter for FakeSorter {
        fn name(&self) -> &str {
            &self.sorter_name
        }

        fn param_table(&self) -> Arc<ParamTable> {
            Arc::new(
                ParamTable::new(vec![ParamSpec {
                    name: "threshold".into(),
                    kind: crate::params::ParamKind::Float,
                    default: ParamValue::Float(5.0),
                    title: "Threshold".into(),
                    min: None,
                    max: None,
                    choices: vec![],
                }])
                .unwrap(),
            )
        }

        fn installation_instructions(&self) -> &str {
            "install the fake"
        }

        fn is_installed(&self, _settings: &SorterSettings) -> bool {
            self.installed
        }

        fn version(&self, _settings: &SorterSettings) -> String {
            "1.0".to_string()
        }

        fn render(&self, _job: &SortJob) -> Result<Vec<RenderedScript>> {
            Ok(vec![])
        }

        fn prepare(&self, _job: &SortJob, _recording: &dyn Recording) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, _job: &SortJob, _executor: &dyn ScriptExecutor) -> Result<()> {
            Ok(())
        }

        fn parse(&self, _output_folder: &Path) -> Result<Sorting> {
            Ok(Sorting::new(1000.0))
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = SorterRegistry::new(SorterSettings::default());
        assert!(registry.available().is_empty());
        assert!(registry.installed().is_empty());
    }

    #[test]
    fn builtin_registry_lists_hdsort() {
        let registry = SorterRegistry::with_builtin(SorterSettings::default());
        assert_eq!(registry.available(), vec!["hdsort"]);
        assert!(registry.installed().is_empty());
    }

    #[test]
    fn available_is_sorted_and_unique() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("gamma", true));
        registry.register(FakeSorter::new("alpha", false));
        registry.register(FakeSorter::new("beta", true));
        let old = registry.register(FakeSorter::new("alpha", true));
        assert!(old.is_some());

        assert_eq!(registry.available(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(registry.installed(), vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn installed_is_subset_of_available() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("a", true));
        registry.register(FakeSorter::new("b", false));
        let available = registry.available();
        assert_eq!(registry.installed(), vec!["a"]);
        assert!(registry.installed().iter().all(|n| available.contains(n)));
    }

    #[test]
    fn unknown_sorter_lists_available() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("a", true));
        let Err(err) = registry.adapter("nope") else {
            panic!("expected an unknown sorter error");
        };
        match err {
            SortError::UnknownSorter { name, available } => {
                assert_eq!(name, "nope");
                assert_eq!(available, vec!["a"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn default_params_match_table() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("a", true));
        let params = registry.default_params("a").unwrap();
        assert_eq!(params.keys().collect::<Vec<_>>(), vec!["threshold"]);
        assert_eq!(params.f64("threshold"), Some(5.0));
    }

    #[test]
    fn versions_cover_installed_only() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("b", true));
        registry.register(FakeSorter::new("a", true));
        registry.register(FakeSorter::new("c", false));
        assert_eq!(registry.format_versions(), "a: 1.0\nb: 1.0");
    }

    #[test]
    fn set_install_path_reprobes() {
        let install = tempfile::tempdir().unwrap();
        let mut registry = SorterRegistry::with_builtin(SorterSettings::default());
        assert!(!registry.is_installed("hdsort"));

        let path = install.path().display().to_string();
        assert!(!registry.set_install_path("hdsort", path.clone()).unwrap());

        std::fs::create_dir(install.path().join("+hdsort")).unwrap();
        assert!(registry.set_install_path("hdsort", path).unwrap());
        assert_eq!(registry.installed(), vec!["hdsort"]);
        assert!(registry.set_install_path("nope", "/x").is_err());
    }

    #[test]
    fn refresh_picks_up_new_installs() {
        let install = tempfile::tempdir().unwrap();
        let settings =
            SorterSettings::default().with_install_path("hdsort", install.path().display().to_string());
        let mut registry = SorterRegistry::with_builtin(settings);
        assert!(registry.installed().is_empty());

        std::fs::create_dir(install.path().join("+hdsort")).unwrap();
        assert!(registry.installed().is_empty());
        registry.refresh();
        assert_eq!(registry.installed(), vec!["hdsort"]);
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = SorterRegistry::new(SorterSettings::default());
        registry.register(FakeSorter::new("test-sorter", true));
        assert!(format!("{registry:?}").contains("test-sorter"));
    }
}
