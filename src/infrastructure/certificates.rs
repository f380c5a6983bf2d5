//! Code-signing keys and script signatures
//!
//! Keys live under `<keys_dir>/{private,public,pfx}/<name>.{key,crt,pfx}`;
//! there is no manifest, a key exists when any of its files does.

use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pki_types::PrivatePkcs8KeyDer;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};

use super::permissions::copy_owner_and_mode;
use super::tool_runner::ToolRunner;
use crate::config::SigningConfig;
use crate::domain::{validate_key_name, KeyComponent, KeyMaterial};
use crate::error::{AppError, AppResult};

const RSA_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// `<dir>/<stem><suffix><ext>`, e.g. `run.ps1` → `run-signed.ps1`
pub fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

/// Remove a file left behind by a failed tool run.
fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial output"),
    }
}

fn crypto_error(context: &str, err: impl std::fmt::Display) -> AppError {
    AppError::FileOperationFailed(format!("{}: {}", context, err))
}

/// PEM key and self-signed code-signing certificate for `name`.
fn generate_key_and_certificate(name: &str) -> AppResult<(String, String)> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .map_err(|e| crypto_error("RSA key generation failed", e))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| crypto_error("PKCS#8 encoding failed", e))?;
    let key_der = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256)
        .map_err(|e| crypto_error("Cannot load generated key", e))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| crypto_error("Invalid certificate parameters", e))?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, name);
    params.distinguished_name = subject;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::CodeSigning];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(VALIDITY_DAYS);

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));

    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| crypto_error("Certificate signing failed", e))?;
    Ok((key_pair.serialize_pem(), certificate.pem()))
}

fn write_private(path: &Path, contents: &str) -> AppResult<()> {
    std::fs::write(path, contents).map_err(|e| AppError::file(format!("Cannot write {}", path.display()), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| AppError::file(format!("Cannot chmod {}", path.display()), e))?;
    }
    Ok(())
}

/// Creates signing keys and signs scripts with them.
#[derive(Debug, Clone)]
pub struct CertificateManager {
    keys_dir: PathBuf,
    openssl: String,
    osslsigncode: String,
    runner: ToolRunner,
}

impl CertificateManager {
    pub fn new(config: &SigningConfig, runner: ToolRunner) -> Self {
        Self {
            keys_dir: config.keys_dir.clone(),
            openssl: config.openssl.clone(),
            osslsigncode: config.osslsigncode.clone(),
            runner,
        }
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    fn material(&self, name: &str) -> KeyMaterial {
        let mut material = KeyMaterial::default();
        for component in KeyComponent::all() {
            let path = component.path(&self.keys_dir, name);
            if path.exists() {
                material.set(*component, path);
            }
        }
        material
    }

    /// Generate an RSA key, a self-signed code-signing certificate and a PKCS#12 bundle.
    pub fn create_keys(&self, name: &str, password: Option<&str>) -> AppResult<KeyMaterial> {
        validate_key_name(name)?;
        if !self.material(name).is_empty() {
            return Err(AppError::AlreadyExists(format!("Key {} already exists", name)));
        }

        for component in KeyComponent::all() {
            let dir = self.keys_dir.join(component.dir_name());
            std::fs::create_dir_all(&dir)
                .map_err(|e| AppError::file(format!("Cannot create {}", dir.display()), e))?;
        }

        let (key_pem, cert_pem) = generate_key_and_certificate(name)?;
        let key_path = KeyComponent::Private.path(&self.keys_dir, name);
        let cert_path = KeyComponent::Public.path(&self.keys_dir, name);
        let pfx_path = KeyComponent::Pfx.path(&self.keys_dir, name);
        write_private(&key_path, &key_pem)?;
        std::fs::write(&cert_path, cert_pem)
            .map_err(|e| AppError::file(format!("Cannot write {}", cert_path.display()), e))?;

        let args: Vec<OsString> = vec![
            "pkcs12".into(),
            "-export".into(),
            "-out".into(),
            pfx_path.clone().into(),
            "-inkey".into(),
            key_path.clone().into(),
            "-in".into(),
            cert_path.clone().into(),
            "-name".into(),
            name.into(),
            "-passout".into(),
            "stdin".into(),
        ];
        let secret = format!("{}\n", password.unwrap_or_default());
        if let Err(e) = self.runner.run(&self.openssl, &args, Some(&secret)) {
            for path in [&key_path, &cert_path, &pfx_path] {
                remove_partial(path);
            }
            return Err(e);
        }

        info!(key = name, "Signing key created");
        Ok(self.material(name))
    }

    /// Every key name with whichever of its files exist.
    pub fn list_keys(&self) -> AppResult<BTreeMap<String, KeyMaterial>> {
        let mut keys: BTreeMap<String, KeyMaterial> = BTreeMap::new();
        for component in KeyComponent::all() {
            let dir = self.keys_dir.join(component.dir_name());
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::file(format!("Cannot read {}", dir.display()), e)),
            };
            for entry in entries {
                let path = entry?.path();
                let matches_ext = path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case(component.extension()))
                    .unwrap_or(false);
                if !path.is_file() || !matches_ext {
                    continue;
                }
                if let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) {
                    keys.entry(stem).or_default().set(*component, path);
                }
            }
        }
        Ok(keys)
    }

    /// Remove whichever files of the key exist. Returns what was there.
    pub fn delete_key(&self, name: &str) -> AppResult<KeyMaterial> {
        validate_key_name(name)?;
        let material = self.material(name);
        if material.is_empty() {
            return Err(AppError::NotFound(format!("Key {} not found", name)));
        }
        for path in material.existing() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(key = name, path = %path.display(), error = %e, "Could not remove key file");
            }
        }
        info!(key = name, "Signing key deleted");
        Ok(material)
    }

    /// Sign `script` with the PKCS#12 bundle.
    ///
    /// Without `output` the signed file replaces `script`; the returned path is
    /// where the signed script ends up.
    pub fn sign(
        &self,
        script: &Path,
        pfx: &Path,
        output: Option<&Path>,
        password: Option<&str>,
    ) -> AppResult<PathBuf> {
        if !pfx.is_file() {
            return Err(AppError::NotFound(format!("PKCS#12 file {} not found", pfx.display())));
        }

        let mut args: Vec<OsString> = vec!["sign".into(), "-pkcs12".into(), pfx.into()];
        if let Some(password) = password {
            args.push("-pass".into());
            args.push(password.into());
        }
        self.transform(script, output, "-signed", args)
    }

    /// Strip the signature from `script`, same output rules as [`Self::sign`].
    pub fn unsign(&self, script: &Path, output: Option<&Path>) -> AppResult<PathBuf> {
        self.transform(script, output, "-unsigned", vec!["remove-signature".into()])
    }

    fn transform(
        &self,
        script: &Path,
        output: Option<&Path>,
        default_suffix: &str,
        mut args: Vec<OsString>,
    ) -> AppResult<PathBuf> {
        if !script.is_file() {
            return Err(AppError::NotFound(format!("Script {} not found", script.display())));
        }
        let target = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| suffixed_path(script, default_suffix));
        if target.exists() {
            return Err(AppError::AlreadyExists(format!("Output {} already exists", target.display())));
        }

        args.extend(["-in".into(), script.into(), "-out".into(), target.clone().into()]);
        // `target` did not exist before the run, so anything there now is the tool's partial output.
        if let Err(e) = self.runner.run(&self.osslsigncode, &args, None) {
            remove_partial(&target);
            return Err(e);
        }
        copy_owner_and_mode(script, &target)?;

        if output.is_some() {
            info!(script = %script.display(), output = %target.display(), "Script rewritten");
            return Ok(target);
        }

        std::fs::remove_file(script)
            .map_err(|e| AppError::file(format!("Cannot remove {}", script.display()), e))?;
        std::fs::rename(&target, script).map_err(|e| {
            AppError::file(format!("Cannot move {} to {}", target.display(), script.display()), e)
        })?;
        info!(script = %script.display(), "Script rewritten in place");
        Ok(script.to_path_buf())
    }
}
