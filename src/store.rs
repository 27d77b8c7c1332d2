//! Durable primary MAC records, one plain-text file per interface.

use log::{debug, info, warn};
use std::fs;
use std::io;
use std::path::PathBuf;

use crate::errors::{ShiftError, ShiftResult};
use crate::mac::MacAddress;

/// Stores the pre-rotation MAC of each interface under `dir`
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<iface>_primary_mac.txt`
    pub fn path_for(&self, iface: &str) -> PathBuf {
        self.dir.join(format!("{}_primary_mac.txt", iface))
    }

    /// Read the primary MAC for `iface`.
    ///
    /// A missing file is `Ok(None)`. A file whose content is not a valid MAC
    /// is treated as absent and logged.
    pub fn load(&self, iface: &str) -> ShiftResult<Option<MacAddress>> {
        let path = self.path_for(iface);
        debug!("Reading primary MAC address from {:?}", path);

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No primary MAC record for {}", iface);
                return Ok(None);
            }
            Err(source) => return Err(ShiftError::Persistence { path, source }),
        };

        match parse_record(&content) {
            Some(mac) => Ok(Some(mac)),
            None => {
                warn!(
                    "Primary MAC record {:?} is corrupt ({:?}), ignoring it",
                    path,
                    content.trim()
                );
                Ok(None)
            }
        }
    }

    /// Overwrite the primary MAC record for `iface`
    pub fn save(&self, iface: &str, mac: &MacAddress) -> ShiftResult<()> {
        let path = self.path_for(iface);
        let persist = |source: io::Error| ShiftError::Persistence {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(persist)?;
        let tmp = path.with_extension("txt.tmp");
        fs::write(&tmp, mac.to_string()).map_err(persist)?;
        fs::rename(&tmp, &path).map_err(persist)?;

        info!("Primary MAC address saved for {}: {}", iface, mac);
        Ok(())
    }

    /// Forget the primary MAC for `iface`. Returns false if there was none.
    pub fn reset(&self, iface: &str) -> ShiftResult<bool> {
        let path = self.path_for(iface);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Primary MAC record for {} removed", iface);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ShiftError::Persistence { path, source }),
        }
    }
}

/// The MAC is the last token; anything before it is a label.
fn parse_record(content: &str) -> Option<MacAddress> {
    let token = content.split_whitespace().last()?;
    let token = token.rsplit('=').next().unwrap_or(token);
    token.parse().ok()
}
