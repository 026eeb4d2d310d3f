//! tcdrop: share files as end-to-end encrypted containers
//!
//! Commands:
//!   send <file>          - seal a file into a container, upload it, print the share link
//!   receive <link>       - download, verify, and save the file behind a share link
//!   inspect <object>     - show the unencrypted header of a stored container
//!   oracle-keygen        - create a local key-wrapping oracle secret
//!   config show          - display current configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use tcdrop_container::reader::HEADER_PEEK_LEN;
use tcdrop_container::transfer::{build_operator, download, upload, DownloadSink, ProgressFn};
use tcdrop_container::{
    peek_header, ByteSource, ContainerReader, ContainerWriter, ReadSummary, ReaderOptions,
    WriterOptions,
};
use tcdrop_core::config::{StorageConfig, TcdropConfig};
use tcdrop_core::{FileMeta, ReasonCode, ShareLink, TcdropError, TcdropResult};
use tcdrop_crypto::{seal_file_key, KeyWrapOracle, LinkSecret, RetryHandler, SecretOracle};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tcdrop",
    version,
    about = "Encrypted link-based file sharing",
    long_about = "tcdrop: seal files into encrypted containers, share them as links, \
                  and open containers received as links"
)]
struct Cli {
    /// Path to tcdrop.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TCDROP_CONFIG",
        default_value = "~/.config/tcdrop/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt and upload a file, then print its share link
    Send {
        /// Local file to share
        file: PathBuf,
        /// Protect the container with a password (prompted)
        #[arg(long)]
        password: bool,
        /// Message shown to the receiver together with the file name
        #[arg(long, short = 'm')]
        message: Option<String>,
        /// Length-concealment padding: none, block:<bytes>, or size-class
        #[arg(long)]
        padding: Option<String>,
        /// File name shown to the receiver (default: the local name)
        #[arg(long)]
        name: Option<String>,
        /// Override the detected MIME type
        #[arg(long)]
        mime: Option<String>,
        /// Object path in storage (default: <prefix>/<random id>)
        #[arg(long)]
        remote: Option<String>,
    },

    /// Download and verify the file behind a share link
    Receive {
        /// Share link in the form <object>#<secret>
        link: String,
        /// Directory the file is saved into
        #[arg(long, short = 'o', default_value = ".")]
        output: PathBuf,
        /// Save without asking after the metadata is shown
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Show the unencrypted header of a stored container
    Inspect {
        /// Object path or share link
        remote: String,
    },

    /// Generate a local key-wrapping oracle secret
    #[command(name = "oracle-keygen")]
    OracleKeygen {
        /// Output file (default: [oracle] secret_file or ~/.config/tcdrop/oracle.key)
        path: Option<PathBuf>,
        /// Replace an existing secret
        #[arg(long)]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, from_file) = load_config(&config_path).await?;
    init_logging(&config.log.level, &config.log.format);
    if !from_file {
        warn!(path = %config_path.display(), "no config file, using defaults");
    }

    match cli.command {
        Commands::Send {
            file,
            password,
            message,
            padding,
            name,
            mime,
            remote,
        } => {
            let opts = SendOptions {
                password,
                message,
                padding,
                name,
                mime,
                remote,
            };
            cmd_send(&config, &file, opts).await
        }
        Commands::Receive { link, output, yes } => {
            cmd_receive(&config, &link, &output, yes).await
        }
        Commands::Inspect { remote } => cmd_inspect(&config, &remote).await,
        Commands::OracleKeygen { path, force } => {
            cmd_oracle_keygen(&config, path.as_deref(), force).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, from_file),
    }
}

// ── Logging and config ────────────────────────────────────────────────────────

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries links and reports; logs go to stderr
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn load_config(path: &Path) -> Result<(TcdropConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((TcdropConfig::default(), false))
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

fn oracle_secret_path(config: &TcdropConfig) -> PathBuf {
    let path = config
        .oracle
        .secret_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("~/.config/tcdrop/oracle.key"));
    expand_tilde(&path)
}

async fn load_oracle(config: &TcdropConfig) -> Result<SecretOracle> {
    let path = oracle_secret_path(config);
    let encoded = tokio::fs::read_to_string(&path).await.with_context(|| {
        format!(
            "reading oracle secret: {}\n\
             Run `tcdrop oracle-keygen` or set [oracle] secret_file in the config.",
            path.display()
        )
    })?;
    SecretOracle::from_base64(&encoded)
        .with_context(|| format!("loading oracle secret: {}", path.display()))
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Attach the user-facing reason to a container error.
fn explain(e: TcdropError) -> anyhow::Error {
    let hint = match e.reason() {
        ReasonCode::InvalidLink => "the link is invalid or does not point at a tcdrop container",
        ReasonCode::WrongPassword => "the password was not accepted",
        ReasonCode::NetworkFailure => "storage or the key-wrapping oracle could not be reached",
        ReasonCode::Corrupted => "the container was modified or damaged; nothing was saved",
        ReasonCode::Internal => "internal error",
    };
    anyhow::Error::new(e).context(hint)
}

// ── `tcdrop send` ─────────────────────────────────────────────────────────────

struct SendOptions {
    password: bool,
    message: Option<String>,
    padding: Option<String>,
    name: Option<String>,
    mime: Option<String>,
    remote: Option<String>,
}

async fn cmd_send(config: &TcdropConfig, file: &Path, opts: SendOptions) -> Result<()> {
    let stat = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    if !stat.is_file() {
        bail!("not a regular file: {}", file.display());
    }
    let local_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("no file name in {}", file.display()))?;

    // The payload is read through an fs operator rooted at the file's directory
    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let local = build_operator(&StorageConfig {
        backend: "fs".into(),
        root: dir,
        ..Default::default()
    })?;
    let source = ByteSource::backing(local, local_name.clone())
        .await
        .with_context(|| format!("opening {}", file.display()))?;

    let password = if opts.password {
        Some(prompt_new_password()?)
    } else {
        None
    };

    let mut container = config.container.clone();
    if let Some(padding) = opts.padding {
        container.padding = padding;
    }
    let options = WriterOptions::from_config(&config.transfer, &container)?;

    let name = opts.name.unwrap_or(local_name);
    let meta = FileMeta {
        mime: opts.mime.unwrap_or_else(|| guess_mime(&name).to_string()),
        name,
        uploaded_at_ms: now_ms(),
        size: source.len(),
        message: opts.message,
    };

    let oracle = load_oracle(config).await?;
    let spinner = make_spinner("send");
    spinner.set_message("wrapping file key...");
    let mut retry = RetryHandler::from_config(&config.retry);
    let sealed = seal_file_key(password.as_ref(), &oracle, &mut retry)
        .await
        .map_err(explain)?;
    spinner.finish_and_clear();

    let mut writer = ContainerWriter::new(&meta, source, &sealed, options)?;
    let store = build_operator(&config.storage)?;
    let object = opts
        .remote
        .unwrap_or_else(|| object_name(&config.storage.prefix));

    println!(
        "Sending {} ({}) → {}",
        file.display(),
        fmt_bytes(meta.size),
        object
    );

    let pb = make_progress_bar(writer.len(), "send");
    pb.set_message(meta.name.clone());
    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done, _total| pb_clone.set_position(done));

    let bytes = upload(
        &store,
        &object,
        &mut writer,
        config.transfer.chunk_size,
        Some(&progress),
    )
    .await
    .map_err(explain)
    .with_context(|| format!("uploading {object}"))?;
    pb.finish_with_message("done".to_string());

    let link = ShareLink::new(object, sealed.link.encode());
    info!(object = %link.object, bytes, "container sent");

    println!();
    println!("Sent:");
    println!("  file:      {} ({})", meta.name, meta.mime);
    println!("  container: {}", fmt_bytes(bytes));
    if let Some(digest) = writer.content_digest() {
        println!("  blake3:    {}", &digest.to_hex()[..16]);
    }
    if password.is_some() {
        println!("  password:  required");
    }
    println!("  link:      {link}");
    Ok(())
}

fn prompt_new_password() -> Result<SecretString> {
    let first = rpassword::prompt_password("Password: ").context("reading password")?;
    if first.is_empty() {
        bail!("empty password");
    }
    let again = rpassword::prompt_password("Repeat password: ").context("reading password")?;
    if first != again {
        bail!("passwords do not match");
    }
    Ok(SecretString::from(first))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Random object name under `prefix`
fn object_name(prefix: &str) -> String {
    let id = hex::encode(rand::random::<[u8; 16]>());
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        id
    } else {
        format!("{prefix}/{id}")
    }
}

fn guess_mime(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "toml" => "application/toml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" | "tgz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

// ── `tcdrop receive` ──────────────────────────────────────────────────────────

async fn cmd_receive(config: &TcdropConfig, link: &str, out: &Path, yes: bool) -> Result<()> {
    let link = ShareLink::parse(link).map_err(explain)?;
    let secret = LinkSecret::decode(&link.secret).map_err(explain)?;
    let oracle: Arc<dyn KeyWrapOracle> = Arc::new(load_oracle(config).await?);
    let store = build_operator(&config.storage)?;

    let mut options = ReaderOptions::from_config(&config.transfer, &config.container);
    // Without --yes the user confirms before any payload is fetched
    options.pause_after_metadata |= !yes;

    let mut reader = ContainerReader::new(
        secret,
        oracle,
        RetryHandler::from_config(&config.retry),
        options,
    );

    println!("Receiving {}", link.object);
    let pb = make_progress_bar(0, "receive");
    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done, total| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
    });

    let mut sink = FileSink::new(expand_tilde(out), yes, pb.clone());
    let result = download(
        &store,
        &link.object,
        &mut reader,
        config.transfer.chunk_size,
        &mut sink,
        Some(&progress),
    )
    .await;

    match result {
        Ok(Some(summary)) => {
            pb.finish_with_message("verified".to_string());
            let saved = sink
                .saved
                .take()
                .context("container verified but no file was staged")?;
            println!();
            println!("Received:");
            println!("  local:  {}", saved.display());
            println!("  bytes:  {}", fmt_bytes(summary.payload_len));
            println!("  blake3: {}", &summary.content_digest.to_hex()[..16]);
            Ok(())
        }
        Ok(None) => {
            pb.abandon_with_message("declined".to_string());
            println!("Declined; nothing was saved.");
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            warn!(error = %e, "receive failed");
            Err(explain(e).context(format!("receiving {}", link.object)))
        }
    }
}

struct Staged {
    part: PathBuf,
    target: PathBuf,
    file: BufWriter<std::fs::File>,
}

/// Writes payload to `<name>.part` and renames it only once the container
/// has verified. A dropped sink removes any leftover part file.
struct FileSink {
    out_dir: PathBuf,
    assume_yes: bool,
    max_password_attempts: u32,
    pb: ProgressBar,
    staged: Option<Staged>,
    saved: Option<PathBuf>,
}

impl FileSink {
    fn new(out_dir: PathBuf, assume_yes: bool, pb: ProgressBar) -> Self {
        Self {
            out_dir,
            assume_yes,
            max_password_attempts: 3,
            pb,
            staged: None,
            saved: None,
        }
    }

    fn stage(&mut self, name: &str) -> TcdropResult<()> {
        let target = self.out_dir.join(safe_file_name(name));
        if target.exists() {
            return Err(TcdropError::Usage(format!(
                "{} already exists",
                target.display()
            )));
        }
        let mut part = target.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);
        let file = std::fs::File::create(&part)?;
        debug!(part = %part.display(), "staging payload");
        self.staged = Some(Staged {
            part,
            target,
            file: BufWriter::new(file),
        });
        Ok(())
    }
}

impl DownloadSink for FileSink {
    fn password(&mut self, attempt: u32) -> Option<SecretString> {
        if attempt > self.max_password_attempts {
            return None;
        }
        self.pb.suspend(|| {
            if attempt > 1 {
                eprintln!("Incorrect password, try again.");
            }
            rpassword::prompt_password("Password: ")
                .ok()
                .filter(|p| !p.is_empty())
                .map(SecretString::from)
        })
    }

    fn metadata(&mut self, meta: &FileMeta) -> TcdropResult<bool> {
        let accepted = self.pb.suspend(|| -> TcdropResult<bool> {
            println!("  name:    {}", meta.name);
            println!("  type:    {}", meta.mime);
            println!("  size:    {}", fmt_bytes(meta.size));
            if let Some(message) = &meta.message {
                println!("  message: {message}");
            }
            if self.assume_yes {
                return Ok(true);
            }
            Ok(confirm("Download this file? [y/N] ")?)
        })?;
        if !accepted {
            return Ok(false);
        }
        self.stage(&meta.name)?;
        Ok(true)
    }

    fn payload(&mut self, data: &[u8]) -> TcdropResult<()> {
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| TcdropError::Usage("payload before metadata".into()))?;
        staged.file.write_all(data)?;
        Ok(())
    }

    fn verified(&mut self, _summary: &ReadSummary) -> TcdropResult<()> {
        let Some(mut staged) = self.staged.take() else {
            return Err(TcdropError::Usage("verified without staged payload".into()));
        };
        staged.file.flush()?;
        staged.file.get_ref().sync_all()?;
        drop(staged.file);
        std::fs::rename(&staged.part, &staged.target)?;
        info!(path = %staged.target.display(), "file saved");
        self.saved = Some(staged.target);
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Some(staged) = self.staged.take() {
            drop(staged.file);
            if let Err(e) = std::fs::remove_file(&staged.part) {
                warn!(part = %staged.part.display(), error = %e, "failed to remove part file");
            }
        }
    }
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

/// Last path component of a sender-chosen name, never a traversal
fn safe_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    match last {
        "" | "." | ".." => "received.bin".to_string(),
        other => other.to_string(),
    }
}

// ── `tcdrop inspect` ──────────────────────────────────────────────────────────

async fn cmd_inspect(config: &TcdropConfig, object: &str) -> Result<()> {
    // Accept a full link; only the object part is used
    let object = ShareLink::parse(object)
        .map(|l| l.object)
        .unwrap_or_else(|_| object.to_string());
    let store = build_operator(&config.storage)?;

    let len = store
        .stat(&object)
        .await
        .with_context(|| format!("stat {object}"))?
        .content_length();
    let end = len.min(HEADER_PEEK_LEN as u64);
    let prefix = store
        .read_with(&object)
        .range(0..end)
        .await
        .with_context(|| format!("reading {object}"))?
        .to_vec();
    let header = peek_header(&prefix).map_err(explain)?;

    println!("Container: {object}");
    println!("  size:      {}", fmt_bytes(len));
    println!("  version:   {}", header.version);
    println!(
        "  password:  {}",
        if header.context.password_set {
            "required"
        } else {
            "none"
        }
    );
    match header.body_len {
        Some(body) => println!("  encrypted: {}", fmt_bytes(body)),
        None => println!("  encrypted: (header truncated)"),
    }
    Ok(())
}

// ── `tcdrop oracle-keygen` ────────────────────────────────────────────────────

async fn cmd_oracle_keygen(config: &TcdropConfig, out: Option<&Path>, force: bool) -> Result<()> {
    let path = out
        .map(expand_tilde)
        .unwrap_or_else(|| oracle_secret_path(config));
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let oracle = SecretOracle::generate();
    tokio::fs::write(&path, format!("{}\n", oracle.to_base64()))
        .await
        .with_context(|| format!("writing {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("restricting {}", path.display()))?;
    }

    println!("Oracle secret written to {}", path.display());
    Ok(())
}

// ── `tcdrop config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &TcdropConfig, config_path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
