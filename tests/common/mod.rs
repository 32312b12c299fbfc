//! Common test utilities for gpg-task integration tests
//!
//! Instead of a real gpg, tests run small shell scripts that speak the status
//! protocol: they write `[GNUPG:]` lines to fd 3, read answers from fd 5 and
//! write attribute data to fd 4. The scripts are run through `/bin/sh` rather
//! than executed directly, so a freshly written script is never exec'd while
//! another test's fork still holds it open for writing. Scripts that must be
//! executed directly are written by a separate process for the same reason.

#![allow(dead_code)]

use gpg_task::TaskConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tempfile::TempDir;

/// Asks for a name and a passphrase, then prints both
pub const PROMPTING_GPG: &str = r#"
echo "[GNUPG:] USERID_HINT 0123456789ABCDEF Alice <alice@example.org>" >&3
echo "[GNUPG:] NEED_PASSPHRASE 0123456789ABCDEF 0123456789ABCDEF 1 0" >&3
echo "[GNUPG:] GET_LINE keygen.name" >&3
read name <&5
echo "[GNUPG:] GOT_IT" >&3
echo "[GNUPG:] GET_HIDDEN passphrase.enter" >&3
read pass <&5
echo "[GNUPG:] GOT_IT" >&3
printf '%s:%s' "$name" "$pass"
"#;

/// Fails the way gpg does on a wrong passphrase
pub const BAD_PASSPHRASE_GPG: &str = r#"
echo "[GNUPG:] NEED_PASSPHRASE 0123456789ABCDEF 0123456789ABCDEF 1 0" >&3
echo "[GNUPG:] BAD_PASSPHRASE 0123456789ABCDEF" >&3
echo "[GNUPG:] FAILURE decrypt 11" >&3
echo "gpg: decryption failed: Bad passphrase" >&2
exit 2
"#;

/// Copies stdin to stdout
pub const CAT_GPG: &str = "exec cat\n";

/// Never finishes on its own
pub const SLEEPING_GPG: &str = "exec sleep 30\n";

/// Prints its arguments, one per line
pub const ECHO_ARGS_GPG: &str = r#"
for arg in "$@"; do
    printf '%s\n' "$arg"
done
"#;

/// Sends one photo ID on the attribute channel
pub const ATTRIBUTE_GPG: &str = r#"
printf 'JPEGDATA' >&4
echo "[GNUPG:] ATTRIBUTE 0123456789ABCDEF0123456789ABCDEF01234567 8 1 1 1 1600000000 0 3" >&3
"#;

/// Swallows stdin, then reports success
pub const CONSUMING_GPG: &str = r#"
cat > /dev/null
echo "[GNUPG:] PLAINTEXT 62 0" >&3
"#;

/// Prints its own pid, asks for a name and waits for the answer
pub const PID_PROMPTING_GPG: &str = r#"
echo $$
echo "[GNUPG:] GET_LINE keygen.name" >&3
read name <&5
printf '%s' "$name"
"#;

/// Finds its descriptors in `--status-fd`, `--command-fd` and
/// `--attribute-fd`, the way gpg does
pub const DESCRIPTOR_GPG: &str = r#"
status=; command=; attribute=
while [ $# -gt 0 ]; do
    case "$1" in
        --status-fd) status=$2; shift 2 ;;
        --command-fd) command=$2; shift 2 ;;
        --attribute-fd) attribute=$2; shift 2 ;;
        *) shift ;;
    esac
done
if [ -z "$status" ] || [ -z "$command" ]; then
    echo "gpg: descriptor arguments missing" >&2
    exit 9
fi
echo "[GNUPG:] GET_LINE keygen.name" >&$status
read name <&$command
echo "[GNUPG:] GOT_IT" >&$status
if [ -n "$attribute" ]; then
    printf 'PHOTO' >&$attribute
fi
printf 'status=%s command=%s attribute=%s name=%s' "$status" "$command" "$attribute" "$name"
"#;

/// A fake gpg script kept alive for the duration of a test
pub struct FakeGpg {
    _dir: TempDir,
    path: PathBuf,
}

impl FakeGpg {
    /// Write `body` as a shell script
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("fake-gpg.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("Failed to write fake gpg");
        Self { _dir: dir, path }
    }

    /// Write `body` as an executable that runs in place of gpg itself
    ///
    /// A child process writes the file, so no descriptor open for writing
    /// can leak into a concurrent fork and make the exec fail.
    pub fn executable(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("gpg");
        let mut writer = Command::new("/bin/sh")
            .arg("-c")
            .arg(r#"cat > "$1" && chmod 755 "$1""#)
            .arg("sh")
            .arg(&path)
            .stdin(Stdio::piped())
            .spawn()
            .expect("Failed to start script writer");
        let mut stdin = writer.stdin.take().expect("writer stdin");
        stdin
            .write_all(format!("#!/bin/sh\n{body}").as_bytes())
            .expect("Failed to write fake gpg");
        drop(stdin);
        assert!(writer.wait().expect("script writer").success());
        Self { _dir: dir, path }
    }

    /// Script path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Task configuration that runs this script in place of gpg
    ///
    /// The script path travels as the first default argument, and descriptor
    /// arguments are left out because `/bin/sh` would take them as options.
    pub fn config(&self) -> TaskConfig {
        TaskConfig {
            gpg_path: Some(PathBuf::from("/bin/sh")),
            default_arguments: vec![self.path.to_string_lossy().into_owned()],
            inject_descriptor_arguments: false,
            ..TaskConfig::default()
        }
    }

    /// Task configuration that executes the script directly, descriptor
    /// arguments included; for scripts made with [`FakeGpg::executable`]
    pub fn direct_config(&self) -> TaskConfig {
        TaskConfig {
            gpg_path: Some(self.path.clone()),
            inject_descriptor_arguments: true,
            ..TaskConfig::default()
        }
    }
}
