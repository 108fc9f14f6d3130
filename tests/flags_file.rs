use std::{fs, fs::File, sync::Arc};

use anyhow::Error;
use race_detection::{CollectingSink, Flags};
use racegrind::{Runtime, Scenario};

fn run_with_flags_file(json: &str, scenario: Scenario) -> Result<Arc<CollectingSink>, Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("flags.json");
    fs::write(&file, json)?;

    let flags = Flags::from_json(File::open(&file)?)?;
    let sink = Arc::new(CollectingSink::new());
    let runtime = Runtime::builder().flags(flags).sink(sink.clone()).build()?;
    scenario.run(&runtime)?;
    runtime.shutdown()?;

    Ok(sink)
}

#[test]
fn disabled_reports_stay_silent() -> Result<(), Error> {
    let sink = run_with_flags_file(r#"{ "report_bugs": false }"#, Scenario::RacyCounter)?;
    assert!(sink.is_empty());
    Ok(())
}

#[test]
fn deduplication_can_be_turned_off() -> Result<(), Error> {
    let json = r#"{
        "suppress_equal_stacks": false,
        "suppress_equal_addresses": false,
        "history_size": 0
    }"#;
    let sink = run_with_flags_file(json, Scenario::RacyCounter)?;
    assert!(sink.len() > 1);
    Ok(())
}

#[test]
fn flags_written_by_to_json_load_back() -> Result<(), Error> {
    let flags = Flags {
        thread_quarantine_size: 0,
        ..Flags::default()
    };
    let sink = run_with_flags_file(&flags.to_json()?, Scenario::MutexCounter)?;
    assert!(sink.is_empty());
    Ok(())
}

#[test]
fn invalid_flags_file_is_rejected() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let file = dir.path().join("flags.json");
    fs::write(&file, r#"{ "history_size": 42 }"#)?;

    Flags::from_json(File::open(&file)?).unwrap_err();
    Ok(())
}
