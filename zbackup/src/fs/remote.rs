//! Remote endpoint over SSH.
//!
//! Listing, directory creation, removal and hashing run as shell commands on
//! the remote host; file contents and stat go through SFTP.

use crate::config::ChecksumAlgo;
use crate::fs::endpoint::{Endpoint, EndpointKind};
use crate::fs::matcher::ExcludeMatcher;
use crate::fs::metadata::{normalize_rel, FileMeta};
use crate::fs::{join_rel, FileSystem, FileWriter, RemoteHash, STAGING_SUFFIX};
use crate::utils::{BackupError, Result};
use chrono::{DateTime, Utc};
use ssh2::{CheckResult, ErrorCode, File, FileStat, KnownHostFileKind, OpenFlags, OpenType, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// libssh2 SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_NO_SUCH_PATH: i32 = 10;

/// Exit status of a shell for "command not found"
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// `FileSystem` backed by an SSH session
pub struct SshFs {
    root: String,
    target: String,
    session: Session,
}

struct CommandOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn summary(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit status {}", self.status)
    }
}

impl SshFs {
    /// Connect and authenticate. Uses the identity file when given, the SSH agent otherwise.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        let EndpointKind::Remote { user, host } = &endpoint.kind else {
            return Err(BackupError::Config(format!(
                "{} is not a remote endpoint",
                endpoint.display_name()
            )));
        };
        let port = endpoint.ssh.port;

        let tcp = TcpStream::connect((host.as_str(), port))?;
        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        if let Some(known_hosts) = &endpoint.ssh.known_hosts {
            verify_host_key(&session, host, port, &expand_home(known_hosts))?;
        }

        let user = user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .ok_or_else(|| BackupError::Config(format!("no SSH user for {}", host)))?;

        match &endpoint.ssh.identity {
            Some(identity) => session.userauth_pubkey_file(&user, None, &expand_home(identity), None)?,
            None => session.userauth_agent(&user)?,
        }
        if !session.authenticated() {
            return Err(BackupError::Config(format!("SSH authentication failed for {}@{}", user, host)));
        }

        info!(remote = %endpoint.display_name(), port, "SSH session established");

        Ok(Self {
            root: endpoint.path.clone(),
            target: endpoint.display_name(),
            session,
        })
    }

    fn remote_path(&self, rel: &str) -> String {
        join_rel(&self.root, rel)
    }

    fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let status = channel.exit_status()?;

        Ok(CommandOutput { status, stdout, stderr })
    }

    /// Run a command and fail unless it exits 0
    fn exec_checked(&self, command: &str, path: &str) -> Result<CommandOutput> {
        let output = self.exec(command)?;
        if output.status != 0 {
            let summary = output.summary();
            if is_not_found_text(&summary) {
                return Err(BackupError::NotFound(path.to_string()));
            }
            return Err(BackupError::Remote(format!("{}: {}", self.target, summary)));
        }
        Ok(output)
    }

    fn list_with_find_printf(&self) -> Result<Option<String>> {
        let command = format!(
            "cd {} && find . -mindepth 1 -printf '%P|%s|%T@|%m|%y\\n'",
            sh_quote(&self.root)
        );
        let output = self.exec(&command)?;
        if output.status == 0 {
            return Ok(Some(output.stdout));
        }
        if is_find_printf_unsupported(&output.stderr) {
            return Ok(None);
        }
        let summary = output.summary();
        if is_not_found_text(&summary) {
            return Err(BackupError::NotFound(self.root.clone()));
        }
        Err(BackupError::Remote(format!("listing {} failed: {}", self.target, summary)))
    }

    /// Listing for hosts whose `find` lacks `-printf` (BusyBox, BSD)
    fn list_with_find_stat(&self) -> Result<String> {
        let command = format!(
            r#"cd {} && find . -mindepth 1 | while IFS= read -r file; do
rel="${{file#./}}"
[ -z "$rel" ] && continue
out=$(stat -c '%s|%Y|%a' "$file" 2>/dev/null || stat -f '%z|%m|%Lp' "$file" 2>/dev/null)
[ -z "$out" ] && continue
if [ -d "$file" ]; then kind=d; elif [ -f "$file" ]; then kind=f; else kind=o; fi
printf '%s|%s|%s\n' "$rel" "$out" "$kind"
done"#,
            sh_quote(&self.root)
        );
        Ok(self.exec_checked(&command, &self.root)?.stdout)
    }

    fn sftp_error(&self, err: ssh2::Error, rel: &str) -> BackupError {
        if is_sftp_not_found(&err) {
            BackupError::NotFound(self.remote_path(rel))
        } else {
            BackupError::Ssh(err)
        }
    }
}

impl FileSystem for SshFs {
    fn root(&self) -> &str {
        &self.root
    }

    fn list(&self, excludes: &[String]) -> Result<Vec<FileMeta>> {
        let matcher = ExcludeMatcher::new(excludes)?;

        let output = match self.list_with_find_printf()? {
            Some(output) => output,
            None => {
                debug!(remote = %self.target, "find -printf unsupported, falling back to stat");
                self.list_with_find_stat()?
            }
        };

        let mut entries: Vec<FileMeta> = output
            .lines()
            .filter_map(parse_list_line)
            .filter(|meta| !matcher.is_excluded_with_ancestors(&meta.rel_path))
            .collect();
        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

        Ok(entries)
    }

    fn open(&self, rel: &str) -> Result<Box<dyn Read + Send>> {
        let sftp = self.session.sftp()?;
        let file = sftp
            .open(Path::new(&self.remote_path(rel)))
            .map_err(|e| self.sftp_error(e, rel))?;
        Ok(Box::new(file))
    }

    fn create(&self, rel: &str, mode: u32) -> Result<Box<dyn FileWriter>> {
        let target = self.remote_path(rel);
        if let Some((parent, _)) = target.rsplit_once('/') {
            if !parent.is_empty() {
                self.exec_checked(&format!("mkdir -p {}", sh_quote(parent)), parent)?;
            }
        }
        let staging = format!("{}{}", target, STAGING_SUFFIX);

        let sftp = self.session.sftp()?;
        let file = sftp
            .open_mode(
                Path::new(&staging),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o600,
                OpenType::File,
            )
            .map_err(|e| self.sftp_error(e, rel))?;

        Ok(Box::new(RemoteStagedFile {
            file: Some(file),
            sftp,
            staging,
            target,
            mode,
            committed: false,
        }))
    }

    fn mkdir_all(&self, rel: &str) -> Result<()> {
        let full = self.remote_path(rel);
        self.exec_checked(&format!("mkdir -p {}", sh_quote(&full)), &full)?;
        Ok(())
    }

    fn remove(&self, rel: &str) -> Result<()> {
        let full = self.remote_path(rel);
        self.exec_checked(&format!("rm -rf {}", sh_quote(&full)), &full)?;
        Ok(())
    }

    fn stat(&self, rel: &str) -> Result<FileMeta> {
        let sftp = self.session.sftp()?;
        let stat = sftp
            .stat(Path::new(&self.remote_path(rel)))
            .map_err(|e| self.sftp_error(e, rel))?;

        let is_dir = stat.is_dir();
        let mod_time = stat
            .mtime
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
            .unwrap_or(DateTime::UNIX_EPOCH);

        Ok(FileMeta {
            rel_path: normalize_rel(rel),
            size: if is_dir { 0 } else { stat.size.unwrap_or(0) },
            mode: stat.perm.unwrap_or(0) & 0o7777,
            mod_time,
            checksum: None,
            is_dir,
        })
    }

    fn close(&self) -> Result<()> {
        self.session.disconnect(None, "zbackup finished", None)?;
        debug!(remote = %self.target, "SSH session closed");
        Ok(())
    }

    fn as_remote_hash(&self) -> Option<&dyn RemoteHash> {
        Some(self)
    }
}

impl RemoteHash for SshFs {
    fn compute_remote_hash(&self, rel: &str, algo: ChecksumAlgo) -> Result<Vec<u8>> {
        let tool = hash_command(algo).ok_or_else(|| BackupError::HashUnavailable(algo.to_string()))?;
        let full = self.remote_path(rel);

        let output = self.exec(&format!("{} {}", tool, sh_quote(&full)))?;
        if output.status == EXIT_COMMAND_NOT_FOUND {
            return Err(BackupError::HashUnavailable(format!("{} on {}", tool, self.target)));
        }
        if output.status != 0 {
            let summary = output.summary();
            if is_not_found_text(&summary) {
                return Err(BackupError::NotFound(full));
            }
            return Err(BackupError::Remote(format!("{} failed: {}", tool, summary)));
        }

        parse_hash_output(&output.stdout)
            .ok_or_else(|| BackupError::Remote(format!("unexpected {} output: {}", tool, output.stdout.trim())))
    }
}

/// Remote [`FileWriter`]. The target is unlinked before the rename because
/// SFTP v3 servers refuse to rename over an existing file.
struct RemoteStagedFile {
    file: Option<File>,
    sftp: Sftp,
    staging: String,
    target: String,
    mode: u32,
    committed: bool,
}

impl RemoteStagedFile {
    fn file(&mut self) -> std::io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "staging file already closed"))
    }
}

impl Write for RemoteStagedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file()?.flush()
    }
}

impl FileWriter for RemoteStagedFile {
    fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.close()?;
        }

        let staging = Path::new(&self.staging);
        let target = Path::new(&self.target);
        let perm = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(self.mode & 0o777),
            atime: None,
            mtime: None,
        };
        self.sftp.setstat(staging, perm)?;
        match self.sftp.unlink(target) {
            Err(e) if !is_sftp_not_found(&e) => return Err(e.into()),
            _ => {}
        }
        self.sftp.rename(staging, target, None)?;

        self.committed = true;
        Ok(())
    }
}

impl Drop for RemoteStagedFile {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = self.sftp.unlink(Path::new(&self.staging));
        }
    }
}

fn is_sftp_not_found(err: &ssh2::Error) -> bool {
    matches!(
        err.code(),
        ErrorCode::SFTP(FX_NO_SUCH_FILE) | ErrorCode::SFTP(FX_NO_SUCH_PATH)
    )
}

fn verify_host_key(session: &Session, host: &str, port: u16, known_hosts: &Path) -> Result<()> {
    let mut known = session.known_hosts()?;
    known.read_file(known_hosts, KnownHostFileKind::OpenSSH)?;

    let (key, _) = session
        .host_key()
        .ok_or_else(|| BackupError::Config(format!("{} sent no host key", host)))?;

    match known.check_port(host, port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(BackupError::Config(format!("host key mismatch for {}", host))),
        CheckResult::NotFound => Err(BackupError::Config(format!(
            "{} not present in {}",
            host,
            known_hosts.display()
        ))),
        CheckResult::Failure => Err(BackupError::Config(format!("host key check failed for {}", host))),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

fn hash_command(algo: ChecksumAlgo) -> Option<&'static str> {
    match algo {
        ChecksumAlgo::None => None,
        ChecksumAlgo::Md5 => Some("md5sum"),
        ChecksumAlgo::Sha1 => Some("sha1sum"),
        ChecksumAlgo::Sha256 => Some("sha256sum"),
    }
}

/// First token of `<hex>  <path>`
fn parse_hash_output(stdout: &str) -> Option<Vec<u8>> {
    let token = stdout.split_whitespace().next()?;
    hex::decode(token.trim_start_matches('\\')).ok()
}

/// Parse one `path|size|mtime|mode|type` line. Paths may contain `|`.
/// Entries that are neither files nor directories are dropped.
fn parse_list_line(line: &str) -> Option<FileMeta> {
    if line.trim().is_empty() {
        return None;
    }
    let mut fields = line.rsplitn(5, '|');
    let kind = fields.next()?.trim();
    let mode = fields.next()?;
    let mtime = fields.next()?;
    let size = fields.next()?;
    let rel = normalize_rel(fields.next()?);
    if rel.is_empty() || rel == "." {
        return None;
    }

    let is_dir = match kind {
        "d" => true,
        "f" => false,
        _ => {
            debug!(path = %rel, kind, "Skipping non-regular remote entry");
            return None;
        }
    };
    let size: u64 = size.trim().parse().ok()?;

    Some(FileMeta {
        rel_path: rel,
        size: if is_dir { 0 } else { size },
        mode: parse_mode(mode),
        mod_time: parse_epoch(mtime),
        checksum: None,
        is_dir,
    })
}

/// Parse `seconds[.fraction]`; unparsable values become the Unix epoch
fn parse_epoch(val: &str) -> DateTime<Utc> {
    let val = val.trim();
    let (secs, frac) = val.split_once('.').unwrap_or((val, ""));
    let Ok(secs) = secs.parse::<i64>() else {
        return DateTime::UNIX_EPOCH;
    };

    let digits: String = frac.chars().take_while(|c| c.is_ascii_digit()).take(9).collect();
    let nanos = if digits.is_empty() {
        0
    } else {
        format!("{:0<9}", digits).parse::<u32>().unwrap_or(0)
    };

    DateTime::from_timestamp(secs, nanos).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Octal permission bits
fn parse_mode(val: &str) -> u32 {
    u32::from_str_radix(val.trim(), 8).map(|m| m & 0o7777).unwrap_or(0)
}

fn is_find_printf_unsupported(output: &str) -> bool {
    let text = output.to_ascii_lowercase();
    text.contains("-printf") || text.contains("unknown predicate") || text.contains("busybox")
}

fn is_not_found_text(msg: &str) -> bool {
    let m = msg.to_ascii_lowercase();
    m.contains("no such file") || m.contains("not found") || m.contains("does not exist")
}

fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_line() {
        let meta = parse_list_line("dir/file.txt|10|1700000000.5000000000|644|f").unwrap();
        assert_eq!(meta.rel_path, "dir/file.txt");
        assert_eq!(meta.size, 10);
        assert_eq!(meta.mode, 0o644);
        assert_eq!(meta.mod_time.timestamp(), 1_700_000_000);
        assert_eq!(meta.mod_time.timestamp_subsec_nanos(), 500_000_000);
        assert!(!meta.is_dir);

        let dir = parse_list_line("dir|4096|1700000000|755|d").unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn test_parse_list_line_pipe_in_name() {
        let meta = parse_list_line("a|b.txt|3|1700000000|600|f").unwrap();
        assert_eq!(meta.rel_path, "a|b.txt");
        assert_eq!(meta.size, 3);
    }

    #[test]
    fn test_parse_list_line_rejects() {
        assert!(parse_list_line("").is_none());
        assert!(parse_list_line("link|10|1700000000|777|l").is_none());
        assert!(parse_list_line("bad|x|1700000000|644|f").is_none());
        assert!(parse_list_line("too|few").is_none());
    }

    #[test]
    fn test_parse_epoch() {
        let t = parse_epoch("1700000000.123456789012");
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(parse_epoch("1700000000.1").timestamp_subsec_nanos(), 100_000_000);
        assert_eq!(parse_epoch("garbage"), DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("644"), 0o644);
        assert_eq!(parse_mode("4755"), 0o4755);
        assert_eq!(parse_mode(""), 0);
    }

    #[test]
    fn test_find_printf_detection() {
        assert!(is_find_printf_unsupported("find: unrecognized: -printf"));
        assert!(is_find_printf_unsupported("BusyBox v1.36.1 multi-call binary"));
        assert!(!is_find_printf_unsupported("find: '/data': Permission denied"));
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("/srv/data"), "'/srv/data'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_parse_hash_output() {
        let out = "d41d8cd98f00b204e9800998ecf8427e  /srv/empty\n";
        assert_eq!(
            parse_hash_output(out).map(hex::encode),
            Some("d41d8cd98f00b204e9800998ecf8427e".to_string())
        );
        assert!(parse_hash_output("").is_none());
        assert_eq!(hash_command(ChecksumAlgo::None), None);
        assert_eq!(hash_command(ChecksumAlgo::Sha256), Some("sha256sum"));
    }
}
