//! File helpers shared by the tasks.

mod io;
pub use io::{LockFile, generate_unique_folder_name};

mod logs;
pub use logs::{get_server_logs, save_log_file};
