use std::{fs, path::Path};

use mash_model::{LogEntry, RecordId, Store};
use mash_net::{Client, Message};
use tracing::{debug, warn};

use super::generate_unique_folder_name;
use crate::TaskError;

/// Write `content` as `filename` in the folder of `entry`.
///
/// A name already used in the entry is numbered: `Job.log`, `Job2.log`, ...
pub fn save_log_file(
    store: &Store,
    root: &Path,
    entry: &mut LogEntry,
    filename: &str,
    content: &[u8],
) -> Result<(), TaskError> {
    let prefix = filename.strip_suffix(".log").unwrap_or(filename);
    let n = entry.files.iter().filter(|f| f.starts_with(prefix)).count();
    let filename = if n > 0 {
        format!("{prefix}{}.log", n + 1)
    } else {
        filename.to_string()
    };

    let folder = root.join(&entry.folder);
    fs::create_dir_all(&folder)?;
    fs::write(folder.join(&filename), content)?;
    debug!(entry = entry.id, file = %filename, "log file saved");

    entry.files.push(filename);
    store.save(entry)?;
    Ok(())
}

/// A plain file name, which cannot leave the folder of a log entry.
fn is_plain_file_name(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains(['/', '\\'])
        && !filename.contains("..")
}

/// Ask the server for its log files and save them in the log entry `logs`,
/// created when needed. Only the files named in `filter` are kept, all of
/// them when there is no filter.
///
/// Returns the log entry, which stays `logs` when the server sent nothing.
pub async fn get_server_logs(
    store: &Store,
    root: &Path,
    client: &mut Client,
    logs: Option<RecordId>,
    filter: Option<&[&str]>,
) -> Result<Option<RecordId>, TaskError> {
    let mut entry = logs.and_then(|id| store.get::<LogEntry>(id));

    if client.send_command(&Message::new("LOGS")).await.is_err() {
        return Ok(logs);
    }

    while let Some(response) = client.wait_response().await {
        if !response.is("LOG_FILE") {
            break;
        }
        let (Some(filename), Some(size)) = (response.text(0), response.int(1)) else {
            break;
        };
        let Some(content) = client.wait_data(size.max(0) as usize).await else {
            break;
        };

        if filter.is_some_and(|names| !names.contains(&filename.as_str())) {
            continue;
        }
        if !is_plain_file_name(&filename) {
            warn!(file = %filename, "log file with an unsafe name ignored");
            continue;
        }

        if entry.is_none() {
            let folder = generate_unique_folder_name().await;
            entry = Some(store.insert(LogEntry {
                folder,
                ..Default::default()
            })?);
        }
        if let Some(current) = entry.as_mut() {
            save_log_file(store, root, current, &filename, &content)?;
        }
    }

    Ok(entry.map(|e| e.id).or(logs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    #[test]
    fn only_plain_names_are_accepted() {
        assert!(is_plain_file_name("Predictor.log"));
        assert!(is_plain_file_name("Job 2.log"));
        for name in ["", "../Job.log", "a/b.log", r"a\b.log", "..", "x..log"] {
            assert!(!is_plain_file_name(name), "{name}");
        }
    }

    #[tokio::test]
    async fn log_files_escaping_the_entry_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut read = BufReader::new(read).lines();
            if let Ok(Some(line)) = read.next_line().await
                && line == "LOGS"
            {
                let answer = "LOG_FILE ../../evil.log 4\nevilLOG_FILE Server.log 2\nokEND_LOGS\n";
                let _ = write.write_all(answer.as_bytes()).await;
            }
            let _ = read.next_line().await;
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Store::new();
        let mut client = Client::new(None);
        client.connect("127.0.0.1", port).await.unwrap();

        let logs = get_server_logs(&store, dir.path(), &mut client, None, None)
            .await
            .unwrap();

        let entry = store.get::<LogEntry>(logs.unwrap()).unwrap();
        assert_eq!(entry.files, vec!["Server.log"]);
        let saved = fs::read_to_string(dir.path().join(&entry.folder).join("Server.log")).unwrap();
        assert_eq!(saved, "ok");
        assert!(!dir.path().join("evil.log").exists());
        assert!(!dir.path().parent().unwrap().join("evil.log").exists());
    }

    #[test]
    fn duplicated_names_are_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new();
        let mut entry = store
            .insert(LogEntry {
                folder: "2026/1/2/3/4/5/6".into(),
                ..Default::default()
            })
            .unwrap();

        for content in ["first", "second", "third"] {
            save_log_file(&store, dir.path(), &mut entry, "Job.log", content.as_bytes()).unwrap();
        }
        save_log_file(&store, dir.path(), &mut entry, "Predictor.log", b"p").unwrap();

        assert_eq!(entry.files, vec!["Job.log", "Job2.log", "Job3.log", "Predictor.log"]);
        let stored = store.get::<LogEntry>(entry.id).unwrap();
        assert_eq!(stored.files.len(), 4);

        let second = fs::read_to_string(dir.path().join("2026/1/2/3/4/5/6/Job2.log")).unwrap();
        assert_eq!(second, "second");
    }
}
