//! Numbered configuration slots provisioned ahead of time.
//!
//! ```text
//! <root>/OP_VPNS/config-N.ovpn
//! <root>/AUTH/auth-N.txt
//! <root>/WG_VPNS/config-N.conf
//! ```

use log::debug;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};

use crate::errors::{ShiftError, ShiftResult};

pub const SLOT_COUNT: usize = 10;

#[derive(Debug, Clone)]
pub struct ConfigPool {
    root: PathBuf,
}

impl ConfigPool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn openvpn_dir(&self) -> PathBuf {
        self.root.join("OP_VPNS")
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.root.join("AUTH")
    }

    pub fn wireguard_dir(&self) -> PathBuf {
        self.root.join("WG_VPNS")
    }

    pub fn auth_file(&self, slot: usize) -> PathBuf {
        self.auth_dir().join(format!("auth-{}.txt", slot))
    }

    /// `N` of a `config-N.*` slot file
    pub fn slot_of(config: &Path) -> Option<usize> {
        config
            .file_stem()?
            .to_str()?
            .strip_prefix("config-")?
            .parse()
            .ok()
    }

    fn existing(dir: &Path, ext: &str) -> Vec<PathBuf> {
        (1..=SLOT_COUNT)
            .map(|n| dir.join(format!("config-{}.{}", n, ext)))
            .filter(|p| p.is_file())
            .collect()
    }

    pub fn openvpn_configs(&self) -> Vec<PathBuf> {
        Self::existing(&self.openvpn_dir(), "ovpn")
    }

    pub fn wireguard_configs(&self) -> Vec<PathBuf> {
        Self::existing(&self.wireguard_dir(), "conf")
    }

    /// Uniformly random choice among existing slots
    pub fn pick(candidates: &[PathBuf], what: &str) -> ShiftResult<PathBuf> {
        let chosen = candidates.choose(&mut rand::thread_rng()).ok_or_else(|| {
            ShiftError::Start {
                backend: what.to_string(),
                reason: "no configuration files available".to_string(),
            }
        })?;
        debug!("Selected {} config {:?} of {}", what, chosen, candidates.len());
        Ok(chosen.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn lists_only_existing_numbered_slots() {
        let dir = tempdir().unwrap();
        let pool = ConfigPool::new(dir.path());
        fs::create_dir_all(pool.wireguard_dir()).unwrap();
        fs::write(pool.wireguard_dir().join("config-2.conf"), "[Interface]").unwrap();
        fs::write(pool.wireguard_dir().join("config-10.conf"), "[Interface]").unwrap();
        fs::write(pool.wireguard_dir().join("config-11.conf"), "[Interface]").unwrap();
        fs::write(pool.wireguard_dir().join("other.conf"), "[Interface]").unwrap();

        let configs = pool.wireguard_configs();
        assert_eq!(
            configs,
            vec![
                pool.wireguard_dir().join("config-2.conf"),
                pool.wireguard_dir().join("config-10.conf"),
            ]
        );
        assert!(pool.openvpn_configs().is_empty());
    }

    #[test]
    fn slot_numbers_come_from_file_names() {
        assert_eq!(ConfigPool::slot_of(Path::new("/p/OP_VPNS/config-7.ovpn")), Some(7));
        assert_eq!(ConfigPool::slot_of(Path::new("config-10.conf")), Some(10));
        assert_eq!(ConfigPool::slot_of(Path::new("wg0.conf")), None);
        assert_eq!(
            ConfigPool::new("/p").auth_file(7),
            PathBuf::from("/p/AUTH/auth-7.txt")
        );
    }

    #[test]
    fn empty_pool_is_a_start_error() {
        assert!(matches!(
            ConfigPool::pick(&[], "OpenVPN"),
            Err(ShiftError::Start { .. })
        ));
    }

    #[test]
    fn pick_returns_a_candidate() {
        let candidates = vec![PathBuf::from("a"), PathBuf::from("b")];
        for _ in 0..20 {
            assert!(candidates.contains(&ConfigPool::pick(&candidates, "x").unwrap()));
        }
    }
}
