//! Image signature verification

use super::reference::Reference;
use crate::error::{Result, RuneError};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Checks an image signature before the image is used
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, reference: &Reference) -> Result<()>;
}

/// `--verify` choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    #[default]
    None,
    Cosign,
}

impl std::str::FromStr for VerifyMode {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(VerifyMode::None),
            "cosign" => Ok(VerifyMode::Cosign),
            other => Err(RuneError::usage(format!("no verifier found: {}", other))),
        }
    }
}

/// Runs the `cosign` executable
#[derive(Debug, Clone)]
pub struct CosignVerifier {
    pub binary: PathBuf,
    pub key: Option<PathBuf>,
}

impl CosignVerifier {
    pub fn new(key: Option<PathBuf>) -> Self {
        Self {
            binary: PathBuf::from("cosign"),
            key,
        }
    }

    fn args(&self, reference: &Reference) -> Vec<String> {
        let mut args = vec!["verify".to_string()];
        match &self.key {
            Some(key) => {
                args.push("--key".to_string());
                args.push(key.display().to_string());
            }
            None => {
                // Keyless: accept any identity, the transparency log still has to agree.
                args.push("--certificate-identity-regexp=.*".to_string());
                args.push("--certificate-oidc-issuer-regexp=.*".to_string());
            }
        }
        args.push(reference.to_string());
        args
    }
}

#[async_trait]
impl Verifier for CosignVerifier {
    async fn verify(&self, reference: &Reference) -> Result<()> {
        let args = self.args(reference);
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let failed = |reason: String| RuneError::ImageVerificationFailed {
            reference: reference.to_string(),
            reason,
        };
        let output = Command::new(&self.binary)
            .args(&args)
            .env("COSIGN_EXPERIMENTAL", "1")
            .output()
            .await
            .map_err(|e| failed(format!("cannot run {}: {}", self.binary.display(), e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(stderr.trim().to_string()));
        }
        info!("signature of {} verified", reference);
        Ok(())
    }
}

/// Build the verifier selected on the command line
pub fn verifier(mode: VerifyMode, key: Option<PathBuf>) -> Option<Box<dyn Verifier>> {
    match mode {
        VerifyMode::None => None,
        VerifyMode::Cosign => Some(Box::new(CosignVerifier::new(key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_mode_parse() {
        assert_eq!("none".parse::<VerifyMode>().unwrap(), VerifyMode::None);
        assert_eq!("cosign".parse::<VerifyMode>().unwrap(), VerifyMode::Cosign);
        assert!("notary".parse::<VerifyMode>().is_err());
        assert!(verifier(VerifyMode::None, None).is_none());
    }

    #[test]
    fn test_cosign_args() {
        let r = Reference::parse("alpine").unwrap();
        let keyed = CosignVerifier::new(Some(PathBuf::from("/keys/cosign.pub")));
        assert_eq!(
            keyed.args(&r),
            vec!["verify", "--key", "/keys/cosign.pub", "docker.io/library/alpine:latest"]
        );
        let keyless = CosignVerifier::new(None);
        assert_eq!(keyless.args(&r).len(), 4);
    }

    #[tokio::test]
    async fn test_failing_verifier_reports_verification_error() {
        let v = CosignVerifier {
            binary: PathBuf::from("false"),
            key: None,
        };
        let err = v.verify(&Reference::parse("alpine").unwrap()).await.unwrap_err();
        assert!(matches!(err, RuneError::ImageVerificationFailed { .. }));

        let v = CosignVerifier {
            binary: PathBuf::from("/nonexistent/cosign"),
            key: None,
        };
        let err = v.verify(&Reference::parse("alpine").unwrap()).await.unwrap_err();
        assert!(matches!(err, RuneError::ImageVerificationFailed { .. }));
    }
}
