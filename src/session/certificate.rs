//! Scoped on-disk copy of a client certificate.

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// A client certificate written to a uniquely named temporary file.
///
/// The file is created with owner-only permissions and is removed when the
/// guard is dropped, on every exit path. Use [`CertificateFile::remove`] to
/// observe removal errors instead of logging them.
#[derive(Debug)]
pub struct CertificateFile {
    file: Option<NamedTempFile>,
}

impl CertificateFile {
    /// Write `pem` to a new file in `dir`, or the system temp dir.
    pub fn create(dir: Option<&Path>, pem: &str) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("winrm-jump-").suffix(".pem");

        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(pem.as_bytes())?;
        file.flush()?;

        debug!(path = %file.path().display(), "Wrote client certificate");
        Ok(Self { file: Some(file) })
    }

    /// Path of the certificate file.
    pub fn path(&self) -> &Path {
        match &self.file {
            Some(file) => file.path(),
            None => Path::new(""),
        }
    }

    /// Read the file back as a TLS client identity.
    pub fn identity(&self) -> Result<reqwest::Identity, String> {
        let pem = std::fs::read(self.path())
            .map_err(|e| format!("Failed to read client certificate: {}", e))?;
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| format!("Invalid client certificate: {}", e))
    }

    /// Remove the file now.
    pub fn remove(mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

impl Drop for CertificateFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove client certificate");
            }
        }
    }
}
