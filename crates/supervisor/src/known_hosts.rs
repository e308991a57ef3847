// tunnel9 - Known Hosts Module
// Host key verification against an OpenSSH known_hosts file

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyResult {
    /// Host key is in known_hosts and matches
    Trusted,
    /// No entry for this host
    Unknown,
    /// Host is known with a different key
    Mismatch {
        actual_fingerprint: String,
        line_number: usize,
    },
}

/// A single plain-text entry in the known_hosts file
#[derive(Debug, Clone)]
struct KnownHostEntry {
    /// Comma-separated host patterns, e.g. "example.com,10.0.0.1" or "[example.com]:2222"
    hosts: Vec<String>,
    key_type: String,
    key_data: String,
    line_number: usize,
}

impl KnownHostEntry {
    /// Parse a single line; comments, markers and hashed hosts are skipped
    fn parse(line: &str, line_number: usize) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            return None;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            warn!("Invalid known_hosts entry at line {}: too few fields", line_number);
            return None;
        }

        // Hashed entries (|1|salt|hash) cannot be matched without HMAC support
        if parts[0].starts_with('|') {
            return None;
        }

        Some(KnownHostEntry {
            hosts: parts[0].split(',').map(str::to_string).collect(),
            key_type: parts[1].to_string(),
            key_data: parts[2].to_string(),
            line_number,
        })
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        let pattern = format_host_pattern(host, port);
        self.hosts.iter().any(|h| *h == pattern)
    }

    fn verify_key(&self, key: &PublicKey) -> bool {
        self.key_type == key.algorithm().as_str() && self.key_data == key.public_key_base64()
    }
}

/// Read-mostly view of a known_hosts file
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Load known_hosts from a path; a missing file has no entries
    pub fn load_from(path: &Path) -> io::Result<Self> {
        let mut entries = Vec::new();

        if path.exists() {
            let file = fs::File::open(path)?;
            for (idx, line) in BufReader::new(file).lines().enumerate() {
                if let Some(entry) = KnownHostEntry::parse(&line?, idx + 1) {
                    entries.push(entry);
                }
            }
            debug!("Loaded {} entries from known_hosts: {}", entries.len(), path.display());
        } else {
            debug!("Known_hosts file does not exist yet: {}", path.display());
        }

        Ok(KnownHosts {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Verify a host key against the loaded entries
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> VerifyResult {
        let matching: Vec<&KnownHostEntry> =
            self.entries.iter().filter(|e| e.matches(host, port)).collect();

        let Some(first) = matching.first() else {
            return VerifyResult::Unknown;
        };
        if matching.iter().any(|e| e.verify_key(key)) {
            return VerifyResult::Trusted;
        }

        VerifyResult::Mismatch {
            actual_fingerprint: calculate_fingerprint(key),
            line_number: first.line_number,
        }
    }

    /// Append a host key; existing lines are never rewritten
    pub fn learn(&mut self, host: &str, port: u16, key: &PublicKey) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let needs_newline = fs::read(&self.path)
            .map(|bytes| !bytes.is_empty() && !bytes.ends_with(b"\n"))
            .unwrap_or(false);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if file.metadata()?.len() == 0 {
                fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
            }
        }

        let entry = KnownHostEntry {
            hosts: vec![format_host_pattern(host, port)],
            key_type: key.algorithm().as_str().to_string(),
            key_data: key.public_key_base64(),
            line_number: self.entries.len() + 1,
        };
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{} {} {}", entry.hosts[0], entry.key_type, entry.key_data)?;

        info!("Added host key for {}:{} to {}", host, port, self.path.display());
        self.entries.push(entry);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Host pattern as OpenSSH writes it: "host" on port 22, "[host]:port" otherwise
fn format_host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// SHA256 fingerprint in OpenSSH notation
pub fn calculate_fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    format!("SHA256:{}", STANDARD_NO_PAD.encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::parse_public_key_base64;
    use tempfile::TempDir;

    const KEY_A: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIK3YVlpENkKPUvf6gVNnYrrs/AFqmAKri3S3vXVGYVx1";
    const KEY_B: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIC2JMgWm/NLUBs7Ydc1hG/a4gi36g0gxLYrNVmgy0iu0";

    fn key(data: &str) -> PublicKey {
        parse_public_key_base64(data).unwrap()
    }

    fn known_hosts_with(contents: &str) -> (TempDir, KnownHosts) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("known_hosts");
        fs::write(&path, contents).unwrap();
        let known_hosts = KnownHosts::load_from(&path).unwrap();
        (temp_dir, known_hosts)
    }

    #[test]
    fn test_format_host_pattern() {
        assert_eq!(format_host_pattern("example.com", 22), "example.com");
        assert_eq!(format_host_pattern("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn test_entry_parse_skips_noise() {
        assert!(KnownHostEntry::parse("# comment", 1).is_none());
        assert!(KnownHostEntry::parse("", 2).is_none());
        assert!(KnownHostEntry::parse("@revoked * ssh-ed25519 AAAA", 3).is_none());
        assert!(KnownHostEntry::parse("|1|abc=|def= ssh-ed25519 AAAA", 4).is_none());
        assert!(KnownHostEntry::parse("host-only", 5).is_none());

        let entry = KnownHostEntry::parse("a.example.com,10.0.0.1 ssh-ed25519 AAAA c", 6).unwrap();
        assert!(entry.matches("10.0.0.1", 22));
        assert!(entry.matches("a.example.com", 22));
        assert!(!entry.matches("a.example.com", 2222));
    }

    #[test]
    fn test_verify() {
        let (_dir, known_hosts) = known_hosts_with(&format!(
            "# header\nbastion ssh-ed25519 {}\n[bastion]:2222 ssh-ed25519 {}\n",
            KEY_A, KEY_B
        ));

        assert_eq!(known_hosts.verify("bastion", 22, &key(KEY_A)), VerifyResult::Trusted);
        assert_eq!(known_hosts.verify("bastion", 2222, &key(KEY_B)), VerifyResult::Trusted);
        assert_eq!(known_hosts.verify("other", 22, &key(KEY_A)), VerifyResult::Unknown);

        match known_hosts.verify("bastion", 22, &key(KEY_B)) {
            VerifyResult::Mismatch {
                actual_fingerprint,
                line_number,
            } => {
                assert_eq!(line_number, 2);
                assert_eq!(actual_fingerprint, calculate_fingerprint(&key(KEY_B)));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_learn_appends_and_keeps_existing_lines() {
        let (_dir, mut known_hosts) = known_hosts_with("# keep me\nfoo ssh-ed25519 AAAA");

        known_hosts.learn("bastion", 2222, &key(KEY_A)).unwrap();
        assert_eq!(
            known_hosts.verify("bastion", 2222, &key(KEY_A)),
            VerifyResult::Trusted
        );

        let contents = fs::read_to_string(known_hosts.path()).unwrap();
        assert!(contents.starts_with("# keep me\nfoo ssh-ed25519 AAAA\n"));
        assert!(contents.ends_with(&format!("[bastion]:2222 ssh-ed25519 {}\n", KEY_A)));

        let reloaded = KnownHosts::load_from(known_hosts.path()).unwrap();
        assert_eq!(
            reloaded.verify("bastion", 2222, &key(KEY_A)),
            VerifyResult::Trusted
        );
    }

    #[test]
    fn test_learn_creates_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ssh").join("known_hosts");
        let mut known_hosts = KnownHosts::load_from(&path).unwrap();
        assert_eq!(known_hosts.verify("h", 22, &key(KEY_A)), VerifyResult::Unknown);

        known_hosts.learn("h", 22, &key(KEY_A)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_fingerprint_format() {
        let fingerprint = calculate_fingerprint(&key(KEY_A));
        assert!(fingerprint.starts_with("SHA256:"));
        assert!(!fingerprint.ends_with('='));
        assert_ne!(fingerprint, calculate_fingerprint(&key(KEY_B)));
    }
}
