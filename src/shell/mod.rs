//! Shell process management.
//!
//! - **Interactive** ([`process::spawn_shell_pgroup`]): a long-lived shell
//!   with piped stdin/stdout/stderr, used by terminal sessions. There is no
//!   PTY inside the sandbox, so the shell sees pipes, not a terminal.
//! - **One-shot** ([`process::exec_command`]): run a tool and capture its
//!   output. Used by the distro controller.

pub mod process;

use std::borrow::Cow;

use crate::config::ShellConfig;

/// Fully resolved launch parameters for a terminal shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: String,
}

impl ShellSpec {
    /// Resolve the configured shell. `bash` is forced interactive with `-i`
    /// since stdin is a pipe; `~` in the working directory expands to `$HOME`.
    pub fn from_config(config: &ShellConfig) -> Self {
        let name = config
            .program
            .rsplit('/')
            .next()
            .unwrap_or(&config.program);
        let args = if name == "bash" {
            vec!["-i".to_string()]
        } else {
            Vec::new()
        };
        Self {
            program: config.program.clone(),
            args,
            working_dir: resolve_working_dir(&config.working_dir),
        }
    }

    pub fn arg_refs(&self) -> Vec<&str> {
        self.args.iter().map(String::as_str).collect()
    }
}

/// Expand `~`, falling back to the process CWD when `$HOME` is unset.
fn resolve_working_dir(dir: &str) -> String {
    match expand_tilde(dir) {
        Cow::Borrowed(d) if d == "~" || d.starts_with("~/") => std::env::current_dir()
            .map_or_else(|_| "/".to_string(), |p| p.to_string_lossy().into_owned()),
        expanded => expanded.into_owned(),
    }
}

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}
