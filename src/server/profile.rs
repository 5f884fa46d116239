//! Syncing a bound profile into an instance's cwd with rsync.

use crate::identity::OwnerInfo;
use crate::server::env::ServerEnvironment;
use crate::server::error::{ServerError, ServerResult};
use crate::utils::{run_capture, run_tool};

const RSYNC: &str = "rsync";

/// rsync's "some files could not be transferred" (source dir missing).
pub const RSYNC_PARTIAL_TRANSFER: i32 = 23;

fn source_arg(env: &ServerEnvironment, profile: &str) -> String {
    format!("{}/", env.profile_dir.join(profile).display())
}

fn dest_arg(env: &ServerEnvironment) -> String {
    format!("{}/", env.cwd.display())
}

/// File list of a `-v` dry run, without rsync's header and summary lines.
pub fn parse_file_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !(line.starts_with("sending incremental file list")
                || line.starts_with("sent ")
                || line.starts_with("total size is"))
        })
        .map(String::from)
        .collect()
}

/// Paths that a copy of `profile` would change in the cwd.
///
/// Exit code [`RSYNC_PARTIAL_TRANSFER`] comes back as `Ok(None)`.
pub async fn profile_delta(env: &ServerEnvironment, profile: &str) -> ServerResult<Option<Vec<String>>> {
    let args = ["-vrun".to_string(), source_arg(env, profile), dest_arg(env)];
    let output = run_capture(RSYNC, &args, &env.cwd, None).await?;
    match output.code() {
        Some(0) => Ok(Some(parse_file_list(&output.stdout))),
        Some(RSYNC_PARTIAL_TRANSFER) => Ok(None),
        _ => Err(ServerError::tool(RSYNC, format!("dry run exited with {}", output.status))),
    }
}

pub async fn copy_profile(env: &ServerEnvironment, profile: &str, owner: &OwnerInfo) -> ServerResult<()> {
    let args = [
        "-au".to_string(),
        "--chown".to_string(),
        format!("{}:{}", owner.username, owner.groupname),
        "--chmod".to_string(),
        "ug=rwX".to_string(),
        source_arg(env, profile),
        dest_arg(env),
    ];
    tracing::info!("[{}] Copying profile {}", env.server_name, profile);
    run_tool(RSYNC, &args, &env.cwd, None).await
}
