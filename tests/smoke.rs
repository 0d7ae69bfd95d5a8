//! Envelope and serialization smoke tests.

use gale::error::GaleError;
use gale::executor::GrepMode;
use gale::output::Channel;
use gale::process::ProcessStatus;
use gale::response::ToolResponse;

#[test]
fn success_envelope_serializes_correctly() {
    let response = ToolResponse::success("hi".to_string(), "command_execute", 0.42);
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();

    assert_eq!(json["status"], "success");
    assert_eq!(json["content"], "hi");
    assert_eq!(json["content_type"], "text");
    assert_eq!(json["metadata"]["tool_name"], "command_execute");
    assert!(json["metadata"]["duration_seconds"].is_f64());
    assert!(json["metadata"].get("error_kind").is_none());
}

#[test]
fn error_envelope_carries_the_classification() {
    let err = GaleError::ProcessNotFound("p42".to_string());
    let response = ToolResponse::error(&err, "command_ps_detail", 0.01);
    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&response).unwrap()).unwrap();

    assert_eq!(json["status"], "error");
    assert_eq!(json["content"], "process not found: p42");
    assert_eq!(json["metadata"]["error_kind"], "process_not_found");
}

#[test]
fn error_kinds_are_distinct_per_taxonomy_entry() {
    let kinds = [
        GaleError::InvalidArgument("x".into()).kind(),
        GaleError::PermissionDenied("x".into()).kind(),
        GaleError::ExecutionFailed("x".into()).kind(),
        GaleError::CommandTimeout {
            timeout_seconds: 1,
            partial_stdout: String::new(),
            partial_stderr: String::new(),
            duration_seconds: 1.0,
        }
        .kind(),
        GaleError::ProcessNotFound("x".into()).kind(),
        GaleError::ProcessControl {
            id: "x".into(),
            message: "y".into(),
        }
        .kind(),
        GaleError::OutputRetrieval("x".into()).kind(),
        GaleError::Storage(std::io::Error::other("x")).kind(),
    ];
    let unique: std::collections::HashSet<&str> = kinds.iter().copied().collect();
    assert_eq!(unique.len(), kinds.len());
}

#[test]
fn storage_errors_do_not_leak_paths_to_clients() {
    let err = GaleError::Storage(std::io::Error::other("/var/secret/place: denied"));
    assert!(!err.user_message().contains("/var/secret"));
}

#[test]
fn wire_enums_use_lowercase_labels() {
    assert_eq!(serde_json::to_string(&Channel::Stdout).unwrap(), "\"stdout\"");
    assert_eq!(
        serde_json::to_string(&ProcessStatus::Terminated).unwrap(),
        "\"terminated\""
    );
    assert_eq!(serde_json::to_string(&GrepMode::Content).unwrap(), "\"content\"");

    let parsed: ProcessStatus = serde_json::from_str("\"running\"").unwrap();
    assert_eq!(parsed, ProcessStatus::Running);
    let parsed: GrepMode = serde_json::from_str("\"line\"").unwrap();
    assert_eq!(parsed, GrepMode::Line);
}
