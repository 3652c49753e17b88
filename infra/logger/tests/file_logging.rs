use qhub_logger::{Logger, parse_level, parse_rotation};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn log_files(dir: &std::path::Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn settings_strings_drive_the_json_file_layer() -> Result<(), Box<dyn std::error::Error>> {
    let tmp_dir = tempdir()?;
    let log_dir = tmp_dir.path().join("nested").join("logs");

    let logger = Logger::builder()
        .name("qhub-file")
        .console(false)
        .level(parse_level(" Warn ")?)
        .env_filter("hyper=error")
        .path(&log_dir)
        .rotation(parse_rotation("NEVER")?)
        .max_files(2)
        .json()
        .init()?;
    assert!(logger.guard().is_some(), "file output needs a worker guard");

    tracing::info!(origin = "https://a.com", "below the configured level");
    tracing::warn!(origin = "https://b.com", "over the group limit");
    drop(logger);

    let files = log_files(&log_dir);
    assert_eq!(files.len(), 1, "a never-rotating appender writes a single file: {files:?}");

    let contents = fs::read_to_string(&files[0])?;
    let lines: Vec<&str> = contents.lines().filter(|line| !line.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1, "only the warning passes the filter: {contents}");
    assert!(lines[0].starts_with('{') && lines[0].ends_with('}'), "json output: {}", lines[0]);
    assert!(lines[0].contains("\"level\":\"WARN\""));
    assert!(lines[0].contains("over the group limit"));
    assert!(lines[0].contains("https://b.com"));
    assert!(!contents.contains("below the configured level"));

    Ok(())
}
