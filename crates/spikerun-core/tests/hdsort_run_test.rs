//! Integration tests for HDSort runs through the registry.
//!
//! Most tests replace MATLAB with a [`ScriptedExecutor`]. The `unix` tests
//! at the bottom run the real shell helper against a fake `matlab` script.

use std::path::Path;
use std::sync::Arc;

use spikerun_core::sorter::hdsort::{CONFIG_SCRIPT, MASTER_SCRIPT};
use spikerun_core::{
    HdSortAdapter, ParamSet, ParamValue, RUN_LOG_FILE, RunOptions, SAMPLERATE_FILE, SortError,
    SortJob, SortRun, SorterAdapter, SorterRegistry, SorterSettings, run_hdsort, run_sorter,
};
use spikerun_data::{InMemoryRecording, Recording, read_mda_recording};
use spikerun_test_utils::{
    FakeInstall, ScriptedExecutor, grouped_recording, sample_sorting, synthetic_recording,
};
use uuid::Uuid;

const FS: f64 = 30_000.0;

fn settings_for(install: &FakeInstall) -> SorterSettings {
    SorterSettings::default().with_install_path("hdsort", install.path_string())
}

fn registry_with(install: &FakeInstall, executor: Arc<ScriptedExecutor>) -> SorterRegistry {
    SorterRegistry::with_builtin(settings_for(install)).with_executor(executor)
}

fn options(folder: &Path) -> RunOptions {
    RunOptions {
        output_folder: Some(folder.to_path_buf()),
        ..RunOptions::default()
    }
}

fn no_overrides() -> Vec<(&'static str, ParamValue)> {
    Vec::new()
}

// -----------------------------------------------------------------------
// Single runs
// -----------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_run_returns_tool_output() {
    let install = FakeInstall::hdsort(Some("1.2.3"));
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    let recording = synthetic_recording(4, 1000, FS);
    let overrides = [
        ("detect_threshold", ParamValue::from(4.2)),
        ("filter", ParamValue::from(true)),
        ("hpf", ParamValue::from(300)),
        ("lpf", ParamValue::from(7000.0)),
    ];
    let result = run_hdsort(&registry, Arc::new(recording.clone()), options(&out), overrides)
        .await
        .unwrap();

    let sorting = result.into_single().expect("single run");
    assert_eq!(sorting.sampling_frequency(), FS);
    assert_eq!(sorting.unit_ids(), vec![1, 2]);
    assert_eq!(sorting.spike_train(1), Some(&[10, 20, 30][..]));
    assert_eq!(sorting.spike_train(2), Some(&[15, 25][..]));

    // Artifacts left for later parsing.
    assert_eq!(std::fs::read_to_string(out.join(SAMPLERATE_FILE)).unwrap(), "30000");
    let config = std::fs::read_to_string(out.join(CONFIG_SCRIPT)).unwrap();
    assert!(config.contains("P.filter = 1;"));
    assert!(config.contains("P.hpf = 300;"));
    assert!(config.contains("P.lpf = 7000;"));
    assert!(config.contains("P.spikeDetection.thr = 4.2;"));
    assert!(out.join(MASTER_SCRIPT).is_file());

    let written = read_mda_recording(&out.join("recording.mda"), FS).unwrap();
    assert_eq!(written.num_channels(), 4);
    assert_eq!(written.trace(2), recording.trace(2));

    let log: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join(RUN_LOG_FILE)).unwrap()).unwrap();
    assert_eq!(log["sorter"], "hdsort");
    assert_eq!(log["succeeded"], true);
    assert_eq!(log["params"]["detect_threshold"], 4.2);

    // Exactly one invocation, in the output folder, with the install path
    // passed to the child.
    let requests = executor.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.working_dir, std::path::absolute(&out).unwrap());
    assert!(request.script.contains("-nosplash -nodisplay"));
    assert!(request.script.contains("-r hdsort_master"));
    assert!(
        request
            .env
            .contains(&("HDSORT_PATH".to_string(), install.path_string()))
    );
    assert_eq!(
        request.log_file.as_deref(),
        Some(request.working_dir.join("spikerun_hdsort.log").as_path())
    );
}

#[tokio::test]
async fn verbose_run_inherits_terminal() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));
    let tmp = tempfile::tempdir().unwrap();

    let opts = RunOptions {
        verbose: true,
        ..options(&tmp.path().join("out"))
    };
    run_hdsort(&registry, Arc::new(synthetic_recording(2, 100, FS)), opts, no_overrides())
        .await
        .unwrap();
    assert_eq!(executor.requests()[0].log_file, None);
}

#[tokio::test]
async fn non_zero_exit_is_execution_error_and_nothing_is_parsed() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::failing(1));
    let registry = registry_with(&install, Arc::clone(&executor));
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    let err = run_hdsort(&registry, Arc::new(synthetic_recording(2, 100, FS)), options(&out), no_overrides())
        .await
        .unwrap_err();

    assert!(matches!(err, SortError::Execution { .. }));
    assert_eq!(err.exit_code(), Some(1));
    assert_eq!(err.to_string(), "hdsort returned a non-zero exit code (1)");
    assert_eq!(executor.calls(), 1);
    assert!(!out.join(SAMPLERATE_FILE).exists());

    let log = std::fs::read_to_string(out.join(RUN_LOG_FILE)).unwrap();
    assert!(log.contains("\"succeeded\": false"));
    assert!(log.contains("non-zero exit code"));

    // The folder holds no result, so a later parse fails cleanly.
    assert!(matches!(
        registry.get_result("hdsort", &out),
        Err(SortError::ResultParse { .. })
    ));
}

#[tokio::test]
async fn missing_install_never_reaches_executor() {
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = SorterRegistry::with_builtin(SorterSettings::default()).with_executor(executor.clone());
    let tmp = tempfile::tempdir().unwrap();

    let err = run_hdsort(
        &registry,
        Arc::new(synthetic_recording(2, 100, FS)),
        options(&tmp.path().join("out")),
        no_overrides(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SortError::Configuration { instructions: Some(_), .. }));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn invalid_parameter_value_is_configuration_error() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));

    let err = run_hdsort(
        &registry,
        Arc::new(synthetic_recording(2, 100, FS)),
        RunOptions::default(),
        [("loop_mode", "cluster")],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SortError::Configuration { .. }));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn result_can_be_parsed_again_by_another_registry() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, executor);
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    let first = run_hdsort(&registry, Arc::new(synthetic_recording(2, 100, FS)), options(&out), no_overrides())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    let fresh = SorterRegistry::with_builtin(SorterSettings::default());
    let again = fresh.get_result("hdsort", &out).unwrap();
    assert_eq!(again, first);
    assert_eq!(again.sampling_frequency(), FS);
}

#[tokio::test]
async fn corrupt_firings_is_a_parse_error() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, executor);
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    run_hdsort(&registry, Arc::new(synthetic_recording(2, 100, FS)), options(&out), no_overrides())
        .await
        .unwrap();

    // float64, 8 bytes per entry, two i64 dims whose product overflows.
    let mut header = Vec::new();
    header.extend_from_slice(&(-7i32).to_le_bytes());
    header.extend_from_slice(&8i32.to_le_bytes());
    header.extend_from_slice(&(-2i32).to_le_bytes());
    header.extend_from_slice(&3i64.to_le_bytes());
    header.extend_from_slice(&(i64::MAX / 2).to_le_bytes());
    std::fs::write(out.join("firings.mda"), &header).unwrap();

    let err = registry.get_result("hdsort", &out).unwrap_err();
    assert!(matches!(err, SortError::ResultParse { .. }), "got: {err:?}");

    std::fs::write(out.join("firings.mda"), &header[..6]).unwrap();
    let err = registry.get_result("hdsort", &out).unwrap_err();
    assert!(matches!(err, SortError::ResultParse { .. }), "got: {err:?}");
}

#[tokio::test]
async fn unwritable_recording_is_io_error_without_run_log() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    // A directory where the recording file should go makes the write fail.
    std::fs::create_dir_all(out.join("recording.mda")).unwrap();

    let adapter = registry.adapter("hdsort").unwrap();
    let params = ParamSet::defaults(adapter.param_table());
    let run = SortRun::new(adapter, Arc::new(settings_for(&install)), &out, params, FS, false).unwrap();

    let err = run
        .run(&synthetic_recording(2, 100, FS), executor.as_ref())
        .await
        .unwrap_err();

    assert!(matches!(err, SortError::Io { .. }), "got: {err:?}");
    assert_eq!(executor.calls(), 0);
    assert!(!out.join(RUN_LOG_FILE).exists());
    assert!(!out.join(MASTER_SCRIPT).exists());
}

#[tokio::test]
async fn delete_output_folder_removes_artifacts_after_parse() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, executor);
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    let opts = RunOptions {
        delete_output_folder: true,
        ..options(&out)
    };
    let sorting = run_sorter(&registry, "hdsort", Arc::new(synthetic_recording(2, 100, FS)), opts, no_overrides())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(sorting.total_spikes(), 5);
    assert!(!out.exists());
}

#[test]
fn render_is_deterministic() {
    let install = FakeInstall::hdsort(None);
    let tmp = tempfile::tempdir().unwrap();
    let adapter = HdSortAdapter::new();
    let job = SortJob {
        run_id: Uuid::nil(),
        sorter: "hdsort".into(),
        output_folder: tmp.path().to_path_buf(),
        params: ParamSet::defaults(adapter.param_table()),
        settings: Arc::new(settings_for(&install)),
        sampling_frequency: FS,
        verbose: false,
    };

    let first = adapter.render(&job).unwrap();
    let second = adapter.render(&job).unwrap();
    assert_eq!(first, second);
}

#[test]
fn template_override_dir_is_used() {
    let install = FakeInstall::hdsort(None);
    let tmp = tempfile::tempdir().unwrap();
    let templates = tempfile::tempdir().unwrap();
    std::fs::write(templates.path().join(MASTER_SCRIPT), "% custom {sort_name}\n").unwrap();
    std::fs::write(templates.path().join(CONFIG_SCRIPT), "P.thr = {detect_threshold};\n").unwrap();

    let mut settings = settings_for(&install);
    settings.templates_dir = Some(templates.path().to_path_buf());
    let adapter = HdSortAdapter::new();
    let job = SortJob {
        run_id: Uuid::nil(),
        sorter: "hdsort".into(),
        output_folder: tmp.path().to_path_buf(),
        params: ParamSet::defaults(adapter.param_table()),
        settings: Arc::new(settings),
        sampling_frequency: FS,
        verbose: false,
    };

    let scripts = adapter.render(&job).unwrap();
    assert_eq!(scripts[0].contents, "% custom hdsort_output\n");
    assert_eq!(scripts[1].contents, "P.thr = 4.2;\n");

    std::fs::write(templates.path().join(CONFIG_SCRIPT), "P.x = {no_such_param};\n").unwrap();
    assert!(matches!(adapter.render(&job), Err(SortError::Template(_))));
}

// -----------------------------------------------------------------------
// Registry metadata
// -----------------------------------------------------------------------

#[test]
fn versions_read_from_install() {
    let install = FakeInstall::hdsort(Some("hdsort-2.0"));
    let registry = SorterRegistry::with_builtin(settings_for(&install));
    assert_eq!(registry.format_versions(), "hdsort: hdsort-2.0");

    let without_file = FakeInstall::hdsort(None);
    let registry = SorterRegistry::with_builtin(settings_for(&without_file));
    assert_eq!(registry.format_versions(), "hdsort: unknown");

    let registry = SorterRegistry::with_builtin(SorterSettings::default());
    assert_eq!(registry.format_versions(), "");
}

#[test]
fn empty_install_dir_is_not_installed() {
    let registry = SorterRegistry::with_builtin(settings_for(&FakeInstall::empty()));
    assert_eq!(registry.available(), vec!["hdsort"]);
    assert!(registry.installed().is_empty());
}

#[test]
fn descriptor_exposes_gui_form() {
    let registry = SorterRegistry::with_builtin(SorterSettings::default());
    let descriptor = registry.descriptor("hdsort").unwrap();
    assert!(!descriptor.installed);
    assert!(descriptor.installation_instructions.contains("HDSORT_PATH"));

    let form = serde_json::to_value(&descriptor.gui_params).unwrap();
    assert_eq!(form[0]["name"], "output_folder");
    assert_eq!(form[3]["name"], "detect_threshold");
    assert_eq!(form[3]["type"], "float");
    assert_eq!(form[3]["default"], 4.2);
    assert_eq!(form[3]["title"], "Relative detection threshold");

    let table_keys: Vec<&str> = descriptor.default_params.table().names().collect();
    let mut sorted = table_keys.clone();
    sorted.sort_unstable();
    assert_eq!(descriptor.default_params.keys().collect::<Vec<_>>(), sorted);
}

// -----------------------------------------------------------------------
// Grouped runs
// -----------------------------------------------------------------------

#[tokio::test]
async fn grouped_run_sorts_each_group_in_its_own_folder() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");

    let recording = grouped_recording(&["a", "b", "a"], 200, FS);
    let opts = RunOptions {
        grouping_property: Some("group".into()),
        ..options(&out)
    };
    let groups = run_hdsort(&registry, Arc::new(recording), opts, no_overrides())
        .await
        .unwrap()
        .into_grouped()
        .expect("grouped run");

    assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    assert_eq!(executor.calls(), 2);

    let a = read_mda_recording(&out.join("a").join("recording.mda"), FS).unwrap();
    let b = read_mda_recording(&out.join("b").join("recording.mda"), FS).unwrap();
    assert_eq!(a.num_channels(), 2);
    assert_eq!(b.num_channels(), 1);
    assert!(out.join("a").join(SAMPLERATE_FILE).is_file());
}

#[tokio::test]
async fn parallel_grouped_run_matches_sequential() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let mut settings = settings_for(&install);
    settings.max_parallel = 2;
    let registry = SorterRegistry::with_builtin(settings).with_executor(executor.clone());
    let tmp = tempfile::tempdir().unwrap();

    let recording: Arc<dyn Recording> = Arc::new(grouped_recording(&["0", "1", "2", "3"], 100, FS));
    let sequential = run_hdsort(
        &registry,
        Arc::clone(&recording),
        RunOptions {
            grouping_property: Some("group".into()),
            ..options(&tmp.path().join("seq"))
        },
        no_overrides(),
    )
    .await
    .unwrap();
    let parallel = run_hdsort(
        &registry,
        recording,
        RunOptions {
            grouping_property: Some("group".into()),
            parallel: true,
            ..options(&tmp.path().join("par"))
        },
        no_overrides(),
    )
    .await
    .unwrap();

    assert_eq!(sequential, parallel);
    assert_eq!(executor.calls(), 8);
    for group in ["0", "1", "2", "3"] {
        assert!(tmp.path().join("par").join(group).join(RUN_LOG_FILE).is_file());
    }
}

#[tokio::test]
async fn parallel_group_failure_is_returned() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::failing(2));
    let registry = registry_with(&install, executor);
    let tmp = tempfile::tempdir().unwrap();

    let err = run_hdsort(
        &registry,
        Arc::new(grouped_recording(&["0", "1"], 100, FS)),
        RunOptions {
            grouping_property: Some("group".into()),
            parallel: true,
            ..options(&tmp.path().join("out"))
        },
        no_overrides(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.exit_code(), Some(2));
}

#[tokio::test]
async fn grouping_by_missing_property_fails() {
    let install = FakeInstall::hdsort(None);
    let executor = Arc::new(ScriptedExecutor::succeeding(sample_sorting(FS)));
    let registry = registry_with(&install, Arc::clone(&executor));

    let plain = InMemoryRecording::new(FS, vec![0, 1], vec![vec![0.0; 10], vec![0.0; 10]]).unwrap();
    let err = run_hdsort(
        &registry,
        Arc::new(plain),
        RunOptions {
            grouping_property: Some("group".into()),
            ..RunOptions::default()
        },
        no_overrides(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SortError::Configuration { .. }));
    assert_eq!(executor.calls(), 0);
}

// -----------------------------------------------------------------------
// Real shell, fake MATLAB
// -----------------------------------------------------------------------

#[cfg(unix)]
mod shell {
    use super::*;
    use spikerun_data::write_firings;
    use spikerun_test_utils::{wait_until_exited, write_fake_matlab, write_hanging_matlab};
    use std::time::Duration;

    #[tokio::test]
    async fn fake_matlab_run_produces_sorting() {
        let install = FakeInstall::hdsort(Some("1.0"));
        let tools = tempfile::tempdir().unwrap();
        let firings = tools.path().join("source_firings.mda");
        write_firings(&firings, &sample_sorting(FS)).unwrap();

        let mut settings = settings_for(&install);
        settings.matlab_command = write_fake_matlab(tools.path(), &firings, 0);
        settings.keep_temp_files = false;
        let registry = SorterRegistry::with_builtin(settings);

        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let sorting = run_hdsort(&registry, Arc::new(synthetic_recording(3, 500, FS)), options(&out), no_overrides())
            .await
            .unwrap()
            .into_single()
            .unwrap();

        assert_eq!(sorting.unit_ids(), vec![1, 2]);
        assert_eq!(sorting.sampling_frequency(), FS);

        let args = std::fs::read_to_string(out.join("matlab_args.txt")).unwrap();
        assert_eq!(args.trim(), "-nosplash -nodisplay -r hdsort_master");
        let seen_path = std::fs::read_to_string(out.join("hdsort_path.txt")).unwrap();
        assert_eq!(seen_path.trim(), install.path_string());
        assert!(out.join("spikerun_hdsort.log").is_file());
    }

    #[tokio::test]
    async fn fake_matlab_failure_reports_exit_code() {
        let install = FakeInstall::hdsort(None);
        let tools = tempfile::tempdir().unwrap();
        let firings = tools.path().join("source_firings.mda");
        write_firings(&firings, &sample_sorting(FS)).unwrap();

        let mut settings = settings_for(&install);
        settings.matlab_command = write_fake_matlab(tools.path(), &firings, 3);
        settings.keep_temp_files = false;
        let registry = SorterRegistry::with_builtin(settings);

        let tmp = tempfile::tempdir().unwrap();
        let err = run_hdsort(
            &registry,
            Arc::new(synthetic_recording(1, 50, FS)),
            options(&tmp.path().join("out")),
            no_overrides(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn watchdog_terminates_hung_tool() {
        let install = FakeInstall::hdsort(None);
        let tools = tempfile::tempdir().unwrap();

        let mut settings = settings_for(&install);
        settings.matlab_command = write_hanging_matlab(tools.path());
        settings.keep_temp_files = false;
        settings.timeout = Some(Duration::from_secs(1));
        let registry = SorterRegistry::with_builtin(settings);

        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");
        let err = run_hdsort(&registry, Arc::new(synthetic_recording(1, 50, FS)), options(&out), no_overrides())
            .await
            .unwrap_err();
        assert!(matches!(err, SortError::Execution { exit_code: None, .. }));

        let pid: u32 = std::fs::read_to_string(out.join("tool.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(
            wait_until_exited(pid, Duration::from_secs(5)),
            "tool {pid} kept running after the watchdog fired"
        );
    }

    #[tokio::test]
    async fn output_folder_with_shell_metacharacters() {
        let install = FakeInstall::hdsort(None);
        let tools = tempfile::tempdir().unwrap();
        let firings = tools.path().join("source_firings.mda");
        write_firings(&firings, &sample_sorting(FS)).unwrap();

        let mut settings = settings_for(&install);
        settings.matlab_command = write_fake_matlab(tools.path(), &firings, 0);
        settings.keep_temp_files = false;
        let registry = SorterRegistry::with_builtin(settings);

        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("run \"1\" $HOME `id` it's");
        let sorting = run_hdsort(&registry, Arc::new(synthetic_recording(2, 100, FS)), options(&out), no_overrides())
            .await
            .unwrap()
            .into_single()
            .unwrap();

        assert_eq!(sorting.unit_ids(), vec![1, 2]);
        assert!(out.join("matlab_args.txt").is_file());
    }
}
