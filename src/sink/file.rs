//! File destination.

use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Write one serialized snapshot to `path`.
///
/// Append mode adds the payload as a single newline-terminated line, so
/// successive snapshots accumulate as NDJSON. Otherwise the file is replaced.
pub async fn write_snapshot(path: &Path, payload: &[u8], append: bool) -> std::io::Result<()> {
    if !append {
        return tokio::fs::write(path, payload).await;
    }

    let mut line = Vec::with_capacity(payload.len() + 1);
    line.extend_from_slice(payload);
    line.push(b'\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");

        write_snapshot(&path, br#"{"n":1}"#, false).await.unwrap();
        write_snapshot(&path, br#"{"n":2}"#, false).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"n":2}"#);
    }

    #[tokio::test]
    async fn test_append_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.ndjson");

        write_snapshot(&path, br#"{"n":1}"#, true).await.unwrap();
        write_snapshot(&path, br#"{"n":2}"#, true).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec![r#"{"n":1}"#, r#"{"n":2}"#]);
        assert!(contents.ends_with('\n'));
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.json");
        assert!(write_snapshot(&path, b"{}", true).await.is_err());
        assert!(write_snapshot(&path, b"{}", false).await.is_err());
    }
}
