use fsbench::{
    campaign::build_plan,
    config::Config,
    report::{self, CampaignMeta, EntryStatus},
};
use std::{fs, path::Path, path::PathBuf};

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fsbench-it-{}", nanoid::nanoid!(5)));
    fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

fn scenario_config(output_dir: &Path) -> Config {
    Config::try_from_str(&format!(
        r#"
        device = "/dev/vdb"
        mountpoint = "/mnt/fsbench"
        output_dir = "{}"

        [[filesystem]]
        name = "ext4"
        storage_driver = "overlay2"
        format_command = "mkfs.ext4 -F {{device}}"

        [[filesystem]]
        name = "btrfs"
        storage_driver = "btrfs"
        format_command = "mkfs.btrfs -f {{device}}"

        [[workload]]
        name = "fio-randwrite"
        mode = "single"
        tool = "fio"
        image = "xridge/fio:latest"
        command = "fio --name=randwrite --directory=/data --output-format=json"
        output = "result.json"
        iterations = 2

        [[monitor]]
        name = "iostat"
        command = "iostat -o JSON -x -d {{device}} {{interval}}"
        interval = 2
        output = "iostat.json"
        tool = "iostat"
        "#,
        output_dir.display()
    ))
    .expect("scenario config should parse")
}

fn meta() -> CampaignMeta {
    CampaignMeta {
        run_id: "itest".to_string(),
        started_at: 1722945600000,
        finished_at: 1722949200000,
        device: "/dev/vdb".to_string(),
    }
}

fn record_success(run_dir: &Path) {
    fs::create_dir_all(run_dir).unwrap();
    fs::copy("./fixtures/fio.json", run_dir.join("result.json")).unwrap();
    fs::copy("./fixtures/iostat.json", run_dir.join("iostat.json")).unwrap();
    fs::write(
        run_dir.join("outcome.json"),
        r#"{"status": "success", "exit_code": 0, "duration_ms": 61234, "error": null}"#,
    )
    .unwrap();
}

// Filesystems [ext4, btrfs], one workload with 2 iterations; btrfs's format
// fails so its runs are never attempted. The report still contains all 4
// tuples: ext4's recorded, btrfs's as missing placeholders.
#[test]
fn failed_filesystem_phase_leaves_missing_placeholders() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let config = scenario_config(&dir);

    let plan = build_plan(
        &dir,
        &config.filter_filesystems(&[])?,
        &config.filter_workloads(&[])?,
    );
    assert_eq!(plan.len(), 4);

    // ext4 completed both iterations before btrfs aborted
    for planned in plan.iter().filter(|p| p.filesystem == "ext4") {
        record_success(&planned.out_dir);
    }

    let report = report::aggregate(&config, &plan, &meta());

    assert_eq!(report.entries.len(), 4);
    for iteration in 1..=2 {
        let entry = report
            .find_entry("ext4", "fio-randwrite", iteration)
            .expect("ext4 entry should exist");
        assert_eq!(entry.status, EntryStatus::Success);
        assert!(entry.records.iter().any(|r| r.tool == "fio"));
        assert!(entry.records.iter().any(|r| r.tool == "iostat"));

        let entry = report
            .find_entry("btrfs", "fio-randwrite", iteration)
            .expect("btrfs entry should exist");
        assert_eq!(entry.status, EntryStatus::Missing);
        assert!(entry.records.is_empty());
    }

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

// A failed iteration is recorded and later iterations still count: the
// report distinguishes recorded-failure from never-attempted.
#[test]
fn failed_iteration_does_not_hide_later_iterations() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let config = scenario_config(&dir);

    let plan = build_plan(
        &dir,
        &config.filter_filesystems(&["ext4".to_string()])?,
        &config.filter_workloads(&[])?,
    );

    // iteration 1 failed without an artifact, iteration 2 succeeded
    let failed_dir = &plan[0].out_dir;
    fs::create_dir_all(failed_dir)?;
    fs::write(
        failed_dir.join("outcome.json"),
        r#"{"status": "failed", "exit_code": null, "duration_ms": null, "error": "App not ready: container fsbench-app not ready within 30s"}"#,
    )?;
    record_success(&plan[1].out_dir);

    let report = report::aggregate(&config, &plan, &meta());

    let entry = report
        .find_entry("ext4", "fio-randwrite", 1)
        .expect("entry should exist");
    assert_eq!(entry.status, EntryStatus::Failed);

    let entry = report
        .find_entry("ext4", "fio-randwrite", 2)
        .expect("entry should exist");
    assert_eq!(entry.status, EntryStatus::Success);

    fs::remove_dir_all(&dir).ok();
    Ok(())
}

// Re-aggregation is derived purely from artifacts: writing the report twice
// over the same tree produces the same entries.
#[test]
fn aggregation_is_stable_across_reruns() -> anyhow::Result<()> {
    let dir = scratch_dir();
    let config = scenario_config(&dir);

    let plan = build_plan(
        &dir,
        &config.filter_filesystems(&["ext4".to_string()])?,
        &config.filter_workloads(&[])?,
    );
    record_success(&plan[0].out_dir);

    let first = report::aggregate(&config, &plan, &meta());
    first.write(&dir)?;
    let second = report::aggregate(&config, &plan, &meta());

    assert_eq!(first.entries.len(), second.entries.len());
    for (a, b) in first.entries.iter().zip(second.entries.iter()) {
        assert_eq!(a.status, b.status);
        assert_eq!(a.records, b.records);
    }

    fs::remove_dir_all(&dir).ok();
    Ok(())
}
