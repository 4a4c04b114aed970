use std::fs;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::NaiveDate;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::SriConfig;
use crate::error::{BillingError, BillingResult};
use crate::fiscal::document::FiscalDocument;

const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const SIGNATURE_METHOD: &str = "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519";
const DIGEST_METHOD: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// A signed fiscal document, ready to submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedDocument {
    pub access_key: String,
    pub xml: String,
}

/// Signs fiscal documents with the issuer's certificate.
pub trait DocumentSigner: Send + Sync {
    fn sign(&self, document: &FiscalDocument, today: NaiveDate) -> BillingResult<SignedDocument>;
}

/// Ed25519 signing key with a validity date.
pub struct CertificateSigner {
    key: SigningKey,
    valid_until: NaiveDate,
}

impl CertificateSigner {
    pub fn new(key: SigningKey, valid_until: NaiveDate) -> Self {
        Self { key, valid_until }
    }

    /// Loads the hex-encoded 32-byte seed at `cert_path`.
    pub fn load(config: &SriConfig) -> BillingResult<Self> {
        let path = config.cert_path.as_ref().ok_or_else(|| {
            BillingError::Configuration("signing certificate path is not configured".to_string())
        })?;
        let valid_until = config.cert_valid_until.ok_or_else(|| {
            BillingError::Configuration("certificate validity date is not configured".to_string())
        })?;

        let raw = fs::read_to_string(path).map_err(|e| {
            BillingError::Configuration(format!(
                "cannot read certificate {}: {}",
                path.display(),
                e
            ))
        })?;
        let bytes = hex::decode(raw.trim()).map_err(|e| {
            BillingError::Configuration(format!("certificate {} is not hex: {}", path.display(), e))
        })?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            BillingError::Configuration(format!(
                "certificate {} must hold a 32-byte key",
                path.display()
            ))
        })?;

        info!(path = %path.display(), valid_until = %valid_until, "Signing certificate loaded");
        Ok(Self::new(SigningKey::from_bytes(&seed), valid_until))
    }

    /// Base64 public key embedded in signed documents.
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.key.verifying_key().to_bytes())
    }
}

impl DocumentSigner for CertificateSigner {
    fn sign(&self, document: &FiscalDocument, today: NaiveDate) -> BillingResult<SignedDocument> {
        if today > self.valid_until {
            return Err(BillingError::Configuration(format!(
                "signing certificate expired on {}",
                self.valid_until
            )));
        }

        let digest_bytes = Sha256::digest(document.xml.as_bytes());
        let signature_bytes = self.key.sign(&digest_bytes).to_bytes();
        let digest = STANDARD.encode(digest_bytes);
        let signature = STANDARD.encode(signature_bytes);

        let block = format!(
            concat!(
                "  <ds:Signature xmlns:ds=\"{ns}\" Id=\"Signature-{key}\">\n",
                "    <ds:SignedInfo>\n",
                "      <ds:SignatureMethod Algorithm=\"{sm}\"/>\n",
                "      <ds:Reference URI=\"#comprobante\">\n",
                "        <ds:DigestMethod Algorithm=\"{dm}\"/>\n",
                "        <ds:DigestValue>{digest}</ds:DigestValue>\n",
                "      </ds:Reference>\n",
                "    </ds:SignedInfo>\n",
                "    <ds:SignatureValue>{signature}</ds:SignatureValue>\n",
                "    <ds:KeyInfo>\n",
                "      <ds:KeyValue>{public_key}</ds:KeyValue>\n",
                "    </ds:KeyInfo>\n",
                "  </ds:Signature>\n",
            ),
            ns = DSIG_NS,
            key = document.access_key,
            sm = SIGNATURE_METHOD,
            dm = DIGEST_METHOD,
            digest = digest,
            signature = signature,
            public_key = self.public_key(),
        );

        let close = document.xml.rfind("</factura>").ok_or_else(|| {
            BillingError::validation("fiscal document has no closing factura element")
        })?;
        let mut xml = String::with_capacity(document.xml.len() + block.len());
        xml.push_str(&document.xml[..close]);
        xml.push_str(&block);
        xml.push_str(&document.xml[close..]);

        Ok(SignedDocument {
            access_key: document.access_key.clone(),
            xml,
        })
    }
}

/// Stands in when no certificate could be loaded; every signature attempt
/// reports the load failure.
pub struct UnavailableSigner {
    reason: String,
}

impl UnavailableSigner {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl DocumentSigner for UnavailableSigner {
    fn sign(&self, _document: &FiscalDocument, _today: NaiveDate) -> BillingResult<SignedDocument> {
        Err(BillingError::Configuration(self.reason.clone()))
    }
}
