//! CLI integration tests
//!
//! Tests the command-line interface end-to-end.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::OnceLock;
use tempfile::TempDir;

const PASSPHRASE: &str = "correct horse battery staple";

/// Get path to the noteseal binary
fn noteseal_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_noteseal"))
}

/// A command with no ambient configuration leaking in from the host.
fn noteseal(settings_dir: &Path) -> Command {
    let mut command = Command::new(noteseal_bin());
    command
        .env_remove("NOTESEAL_PUBLIC_KEY")
        .env_remove("NOTESEAL_PRIVATE_KEY")
        .env("NOTESEAL_CONFIG", settings_dir.join("absent.toml"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Run noteseal with passphrase from stdin
fn run_noteseal_with_passphrase(
    settings_dir: &Path,
    args: &[&str],
    passphrase: &str,
) -> std::io::Result<Output> {
    let mut child = noteseal(settings_dir)
        .arg("--passphrase-stdin")
        .args(args)
        .spawn()?;

    {
        let stdin = child.stdin.as_mut().expect("failed to open stdin");
        // The command may exit before reading stdin.
        let _ = stdin.write_all(passphrase.as_bytes());
    }

    child.wait_with_output()
}

fn run_noteseal(settings_dir: &Path, args: &[&str]) -> std::io::Result<Output> {
    run_noteseal_with_passphrase(settings_dir, args, "")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

struct Keys {
    _dir: TempDir,
    public: PathBuf,
    private: PathBuf,
}

/// One unprotected key pair shared by every test; generating 4096-bit keys
/// is the slow part of this suite.
fn shared_keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("keys");
        let result = run_noteseal(
            dir.path(),
            &["keygen", "--out", out.to_str().unwrap(), "--no-passphrase"],
        )
        .unwrap();
        assert!(result.status.success(), "keygen failed: {}", stderr(&result));
        Keys {
            public: out.join("noteseal_public.pem"),
            private: out.join("noteseal_private.pem"),
            _dir: dir,
        }
    })
}

fn key_args(keys: &Keys) -> Vec<String> {
    vec![
        "--public-key".to_string(),
        keys.public.display().to_string(),
        "--private-key".to_string(),
        keys.private.display().to_string(),
    ]
}

fn run_with_keys(dir: &Path, keys: &Keys, args: &[&str]) -> Output {
    let mut all: Vec<String> = key_args(keys);
    all.extend(args.iter().map(|arg| arg.to_string()));
    let all: Vec<&str> = all.iter().map(String::as_str).collect();
    run_noteseal(dir, &all).unwrap()
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_encrypt_decrypt_roundtrip() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("hello.txt");
    let crypt = temp_dir.path().join("hello.txt.enc");
    let decrypted = temp_dir.path().join("hello-decrypted.txt");
    fs::write(&plain, "hello").unwrap();

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["encrypt", "-i", path_str(&plain), "-o", path_str(&crypt)],
    );
    assert!(result.status.success(), "encrypt failed: {}", stderr(&result));

    let envelope: serde_json::Value = serde_json::from_slice(&fs::read(&crypt).unwrap()).unwrap();
    let fields = envelope.as_object().unwrap();
    assert_eq!(fields.len(), 6);
    assert_eq!(envelope["version"], 2);
    for field in ["encryptedKey", "iv", "authTag", "content", "hmac"] {
        assert!(fields[field].is_string(), "missing {}", field);
    }

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );
    assert!(result.status.success(), "decrypt failed: {}", stderr(&result));
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "hello");
}

#[test]
fn test_command_aliases() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "alias test").unwrap();

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["e", "-i", path_str(&plain), "-o", path_str(&crypt)],
    );
    assert!(result.status.success(), "e failed: {}", stderr(&result));

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["d", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );
    assert!(result.status.success(), "d failed: {}", stderr(&result));
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "alias test");
}

#[cfg(unix)]
#[test]
fn test_outputs_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "private").unwrap();

    run_with_keys(
        temp_dir.path(),
        keys,
        &["encrypt", "-i", path_str(&plain), "-o", path_str(&crypt)],
    );
    run_with_keys(
        temp_dir.path(),
        keys,
        &["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );

    for path in [&crypt, &decrypted, &keys.private] {
        let mode = fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "{} has mode {:o}", path.display(), mode);
    }
}

#[test]
fn test_update_replaces_note() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let first = temp_dir.path().join("first.txt");
    let second = temp_dir.path().join("second.txt");
    let crypt = temp_dir.path().join("note.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&first, "first").unwrap();
    fs::write(&second, "second").unwrap();

    run_with_keys(
        temp_dir.path(),
        keys,
        &["encrypt", "-i", path_str(&first), "-o", path_str(&crypt)],
    );
    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["u", "-i", path_str(&second), "-o", path_str(&crypt)],
    );
    assert!(result.status.success(), "update failed: {}", stderr(&result));

    run_with_keys(
        temp_dir.path(),
        keys,
        &["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "second");
}

#[test]
fn test_tampered_file_is_rejected() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "do not touch").unwrap();

    run_with_keys(
        temp_dir.path(),
        keys,
        &["encrypt", "-i", path_str(&plain), "-o", path_str(&crypt)],
    );
    let mut envelope: serde_json::Value =
        serde_json::from_slice(&fs::read(&crypt).unwrap()).unwrap();
    envelope["content"] = serde_json::Value::from("AAAAAAAAAAAA");
    fs::write(&crypt, envelope.to_string()).unwrap();

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );
    assert!(!result.status.success());
    assert!(stderr(&result).contains("tampered"), "{}", stderr(&result));
    assert!(!decrypted.exists());
}

#[test]
fn test_missing_key_configuration() {
    let temp_dir = TempDir::new().unwrap();
    let plain = temp_dir.path().join("plain.txt");
    fs::write(&plain, "x").unwrap();

    let result = run_noteseal(
        temp_dir.path(),
        &[
            "encrypt",
            "-i",
            path_str(&plain),
            "-o",
            path_str(&temp_dir.path().join("out.enc")),
        ],
    )
    .unwrap();
    assert!(!result.status.success());
    assert!(stderr(&result).contains("no public key configured"), "{}", stderr(&result));
}

#[test]
fn test_nonexistent_input_file() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &[
            "encrypt",
            "-i",
            path_str(&temp_dir.path().join("missing.txt")),
            "-o",
            path_str(&temp_dir.path().join("out.enc")),
        ],
    );
    assert!(!result.status.success());
    assert!(stderr(&result).contains("missing.txt"), "{}", stderr(&result));
}

#[test]
fn test_keys_from_settings_file() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let settings = temp_dir.path().join("config.toml");
    fs::write(
        &settings,
        format!(
            "[keys]\npublic_key = {:?}\nprivate_key = {:?}\n",
            keys.public.display().to_string(),
            keys.private.display().to_string()
        ),
    )
    .unwrap();
    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "from settings").unwrap();

    for args in [
        ["encrypt", "-i", path_str(&plain), "-o", path_str(&crypt)],
        ["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    ] {
        let mut all = vec!["--config", path_str(&settings)];
        all.extend(args);
        let result = run_noteseal(temp_dir.path(), &all).unwrap();
        assert!(result.status.success(), "{}", stderr(&result));
    }
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "from settings");
}

#[test]
fn test_info_reports_storage() {
    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let result = run_with_keys(temp_dir.path(), keys, &["info"]);
    assert!(result.status.success(), "{}", stderr(&result));

    let out = stdout(&result);
    assert!(out.contains("security level:"), "{}", out);
    assert!(out.contains(&keys.public.display().to_string()), "{}", out);
    assert!(out.contains("session timeout: 15 min"), "{}", out);
}

#[test]
fn test_protected_key_requires_passphrase() {
    let temp_dir = TempDir::new().unwrap();
    let out = temp_dir.path().join("keys");
    let result = run_noteseal_with_passphrase(
        temp_dir.path(),
        &["keygen", "--out", path_str(&out)],
        PASSPHRASE,
    )
    .unwrap();
    assert!(result.status.success(), "keygen failed: {}", stderr(&result));

    let private = out.join("noteseal_private.pem");
    assert!(fs::read_to_string(&private).unwrap().contains("ENCRYPTED PRIVATE KEY"));

    let plain = temp_dir.path().join("plain.txt");
    let crypt = temp_dir.path().join("plain.txt.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");
    fs::write(&plain, "protected").unwrap();
    let public = out.join("noteseal_public.pem");
    let keys = vec!["--public-key", path_str(&public), "--private-key", path_str(&private)];

    let mut encrypt = keys.clone();
    encrypt.extend(["encrypt", "-i", path_str(&plain), "-o", path_str(&crypt)]);
    let result = run_noteseal(temp_dir.path(), &encrypt).unwrap();
    assert!(result.status.success(), "{}", stderr(&result));

    let mut decrypt = keys;
    decrypt.extend(["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)]);
    let result = run_noteseal_with_passphrase(temp_dir.path(), &decrypt, "wrong").unwrap();
    assert!(!result.status.success());
    assert!(stderr(&result).contains("incorrect passphrase"), "{}", stderr(&result));
    assert!(!decrypted.exists());

    let result = run_noteseal_with_passphrase(temp_dir.path(), &decrypt, PASSPHRASE).unwrap();
    assert!(result.status.success(), "{}", stderr(&result));
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "protected");
}

#[cfg(unix)]
#[test]
fn test_edit_reencrypts_on_close() {
    use std::os::unix::fs::PermissionsExt;

    let keys = shared_keys();
    let temp_dir = TempDir::new().unwrap();
    let editor = temp_dir.path().join("editor.sh");
    fs::write(&editor, "#!/bin/sh\nprintf 'edited in place' > \"$1\"\n").unwrap();
    fs::set_permissions(&editor, fs::Permissions::from_mode(0o755)).unwrap();

    let crypt = temp_dir.path().join("note.enc");
    let decrypted = temp_dir.path().join("decrypted.txt");

    let mut args = key_args(keys);
    args.extend([
        "edit".to_string(),
        "--create".to_string(),
        crypt.display().to_string(),
    ]);
    let result = noteseal(temp_dir.path())
        .env("VISUAL", &editor)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert!(result.status.success(), "edit failed: {}", stderr(&result));

    let result = run_with_keys(
        temp_dir.path(),
        keys,
        &["decrypt", "-i", path_str(&crypt), "-o", path_str(&decrypted)],
    );
    assert!(result.status.success(), "{}", stderr(&result));
    assert_eq!(fs::read_to_string(&decrypted).unwrap(), "edited in place");
}
