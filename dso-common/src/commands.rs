//! Remote shell command builders.
//!
//! Every command sent over a shell channel is built here so quoting is
//! applied in one place. Paths and process names are quoted with
//! `shell-escape`.

use std::borrow::Cow;

use crate::transport::FileMeta;

/// Exit status used by read/delete wrappers when the target is missing.
pub const NOT_FOUND_STATUS: i32 = 44;

/// Round-trip command used to confirm a shell channel is alive.
pub const LIVENESS: &str = "echo dso-ready";

/// Expected stdout of [`LIVENESS`].
pub const LIVENESS_REPLY: &str = "dso-ready";

/// System identification string, inspected for variant signatures.
pub const SYSTEM_IDENTITY: &str = "uname -a";

/// Quote a single argument for a POSIX shell.
pub fn quote(arg: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(arg)).into_owned()
}

/// Literal existence test; exit status 0 means present.
pub fn exists_test(path: &str) -> String {
    format!("test -e {}", quote(path))
}

/// Kill every process with `name`. Succeeds when nothing is running.
pub fn terminate_process(name: &str) -> String {
    format!("killall -9 {} 2>/dev/null || true", quote(name))
}

pub fn mkdir_all(path: &str) -> String {
    format!("mkdir -p {}", quote(path))
}

pub fn chmod(path: &str, mode: u32, recursive: bool) -> String {
    let flag = if recursive { "-R " } else { "" };
    format!("chmod {flag}{mode:o} {}", quote(path))
}

/// Stream a file to stdout, exiting with [`NOT_FOUND_STATUS`] if absent.
pub fn read_file(path: &str) -> String {
    let p = quote(path);
    format!("if [ -e {p} ]; then cat {p}; else exit {NOT_FOUND_STATUS}; fi")
}

/// Write stdin to a file, replacing it.
pub fn write_file(path: &str) -> String {
    format!("cat > {}", quote(path))
}

/// Delete a file, exiting with [`NOT_FOUND_STATUS`] if absent.
pub fn delete_file(path: &str) -> String {
    let p = quote(path);
    format!("if [ -e {p} ]; then rm -rf {p}; else exit {NOT_FOUND_STATUS}; fi")
}

/// BSD `stat` producing `<type>|<size>|<octal perms>`.
pub fn stat(path: &str) -> String {
    format!("stat -f '%HT|%z|%Lp' {}", quote(path))
}

/// Parse the output of [`stat`].
pub fn parse_stat(output: &str) -> Option<FileMeta> {
    let mut parts = output.trim().splitn(3, '|');
    let kind = parts.next()?;
    let size = parts.next()?.trim().parse::<u64>().ok()?;
    let mode = parts
        .next()
        .and_then(|m| u32::from_str_radix(m.trim(), 8).ok());
    Some(FileMeta {
        is_dir: kind.eq_ignore_ascii_case("directory"),
        size,
        mode,
    })
}
