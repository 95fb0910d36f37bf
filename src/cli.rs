// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Command line surface.
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;

use helmwrap::carvel::DEFAULT_PLATFORM;
use helmwrap::chart::annotate::annotate;
use helmwrap::chart::{DEFAULT_ANNOTATIONS_KEY, LOCK_FILE, VALUES_FILE};
use helmwrap::info::info;
use helmwrap::lock::{generate, LockOptions};
use helmwrap::registry::auth::DockerConfig;
use helmwrap::registry::{OciRegistry, RegistryOptions};
use helmwrap::relocate::{relocate_chart, RelocateOptions};
use helmwrap::report::TerminalReporter;
use helmwrap::retry::DEFAULT_MAX_RETRIES;
use helmwrap::transport::{pull_images, push_images, TransportOptions};
use helmwrap::unwrap::{unwrap, UnwrapOptions};
use helmwrap::wrap::{wrap, WrapOptions};
use helmwrap::{write, ImagesLock, Session};

#[derive(FromArgs, Debug)]
/// Wrap Helm charts and their container images into a single archive
pub struct Cli {
    /// accept invalid TLS certificates from registries
    #[argh(switch)]
    pub insecure: bool,
    /// talk plain HTTP to registries
    #[argh(switch)]
    pub use_plain_http: bool,
    /// chart annotation listing the images (default: images)
    #[argh(option, default = "DEFAULT_ANNOTATIONS_KEY.to_string()")]
    pub annotations_key: String,
    /// log level: trace, debug, info, warn or error (default: info)
    #[argh(option, default = "String::from(\"info\")")]
    pub log_level: String,
    /// no progress bars
    #[argh(switch)]
    pub plain: bool,
    /// keep the working directory instead of removing it on exit
    #[argh(switch)]
    pub keep_artifacts: bool,
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Command {
    Wrap(WrapCmd),
    Unwrap(UnwrapCmd),
    Info(InfoCmd),
    Charts(ChartsCmd),
    Images(ImagesCmd),
    Auth(AuthCmd),
    Version(VersionCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "wrap")]
/// Wrap a chart and its images into <name>-<version>.wrap.tgz
pub struct WrapCmd {
    /// chart directory, packaged chart or oci:// URL
    #[argh(positional)]
    chart: String,
    /// output file or directory
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
    /// platform to keep, os/arch[/variant]; repeat for more (default: all)
    #[argh(option)]
    platform: Vec<String>,
    /// also wrap metadata and signature artifacts
    #[argh(switch)]
    fetch_artifacts: bool,
    /// do not pull images
    #[argh(switch)]
    skip_images: bool,
    /// write a Carvel imgpkg bundle next to the chart
    #[argh(switch)]
    add_carvel_bundle: bool,
    /// platform listed in the Carvel images file (default: linux/amd64)
    #[argh(option, default = "DEFAULT_PLATFORM.to_string()")]
    carvel_platform: String,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
    /// registry username
    #[argh(option)]
    registry_username: Option<String>,
    /// registry password
    #[argh(option)]
    registry_password: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "unwrap")]
/// Relocate a wrap to a registry and push its images and chart there
pub struct UnwrapCmd {
    /// wrap file, expanded wrap directory or oci:// URL
    #[argh(positional)]
    wrap: String,
    /// target registry, e.g. registry.example/project
    #[argh(positional)]
    registry: String,
    /// answer yes to every question
    #[argh(switch, short = 'y')]
    yes: bool,
    /// where to push the chart (default: the target registry)
    #[argh(option)]
    push_chart_url: Option<String>,
    /// extra values file to relocate, relative to the chart; repeat for more
    #[argh(option)]
    values: Vec<PathBuf>,
    /// only relocate and push the chart
    #[argh(switch)]
    skip_images: bool,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
    /// registry username
    #[argh(option)]
    registry_username: Option<String>,
    /// registry password
    #[argh(option)]
    registry_password: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "info")]
/// Show what a wrap holds
pub struct InfoCmd {
    /// wrap file or expanded wrap directory
    #[argh(positional)]
    wrap: PathBuf,
    /// print the Images.lock instead of a summary
    #[argh(switch)]
    yaml: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "charts")]
/// Chart commands
pub struct ChartsCmd {
    #[argh(subcommand)]
    command: ChartsCommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum ChartsCommand {
    Annotate(AnnotateCmd),
    Relocate(RelocateCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "annotate")]
/// Guess chart images from values.yaml and record them in Chart.yaml (experimental)
pub struct AnnotateCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "relocate")]
/// Point every image reference of a chart at a new registry
pub struct RelocateCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
    /// registry prefix, e.g. registry.example/project
    #[argh(positional)]
    prefix: String,
    /// extra values file to relocate, relative to the chart; repeat for more
    #[argh(option)]
    values: Vec<PathBuf>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "images")]
/// Image commands
pub struct ImagesCmd {
    #[argh(subcommand)]
    command: ImagesCommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum ImagesCommand {
    Lock(LockCmd),
    Verify(VerifyCmd),
    Pull(PullCmd),
    Push(PushCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "lock")]
/// Write the Images.lock of a chart
pub struct LockCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
    /// lock file to write (default: <chart>/Images.lock)
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
    /// platform to keep, os/arch[/variant]; repeat for more (default: all)
    #[argh(option)]
    platform: Vec<String>,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "verify")]
/// Check that a chart's Images.lock matches its registries
pub struct VerifyCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
    /// lock file to check (default: <chart>/Images.lock)
    #[argh(option)]
    lock: Option<PathBuf>,
    /// platform to keep, os/arch[/variant]; repeat for more (default: all)
    #[argh(option)]
    platform: Vec<String>,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "pull")]
/// Pull the images of a chart's Images.lock into OCI layouts
pub struct PullCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
    /// directory receiving the <HEX>.layout directories (default: images)
    #[argh(option, short = 'o', default = "PathBuf::from(\"images\")")]
    output_dir: PathBuf,
    /// also pull metadata and signature artifacts into this directory
    #[argh(option)]
    artifacts_dir: Option<PathBuf>,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "push")]
/// Push pulled images to the references of a chart's Images.lock
pub struct PushCmd {
    /// chart directory
    #[argh(positional)]
    chart: PathBuf,
    /// directory holding the <HEX>.layout directories (default: images)
    #[argh(option, short = 'i', default = "PathBuf::from(\"images\")")]
    images_dir: PathBuf,
    /// also push the metadata and signature artifacts found in this directory
    #[argh(option)]
    artifacts_dir: Option<PathBuf>,
    /// attempts per registry operation (default: 3)
    #[argh(option, default = "DEFAULT_MAX_RETRIES")]
    max_retries: u32,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "auth")]
/// Registry credentials
pub struct AuthCmd {
    #[argh(subcommand)]
    command: AuthCommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum AuthCommand {
    Login(LoginCmd),
    Logout(LogoutCmd),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "login")]
/// Store credentials for a registry in the docker config
pub struct LoginCmd {
    /// registry host
    #[argh(positional)]
    server: String,
    /// username
    #[argh(option, short = 'u')]
    username: String,
    /// password
    #[argh(option, short = 'p')]
    password: Option<String>,
    /// read the password from stdin
    #[argh(switch)]
    password_stdin: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "logout")]
/// Remove the stored credentials of a registry
pub struct LogoutCmd {
    /// registry host
    #[argh(positional)]
    server: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version")]
/// Print the version
pub struct VersionCmd {}

impl Cli {
    fn session(
        &self,
        cancel: &CancellationToken,
        max_retries: u32,
        username: Option<String>,
        password: Option<String>,
    ) -> Session {
        let registry = OciRegistry::new(RegistryOptions {
            insecure: self.insecure,
            plain_http: self.use_plain_http,
            username,
            password,
        });
        Session::new(Arc::new(registry))
            .with_cancel(cancel.clone())
            .with_reporter(Arc::new(TerminalReporter::new(self.plain)))
            .with_max_retries(max_retries)
    }

    fn lock_options(&self, platforms: &[String]) -> LockOptions {
        LockOptions {
            annotations_key: self.annotations_key.clone(),
            platforms: platforms.to_vec(),
        }
    }
}

pub async fn run(cli: &Cli, cancel: &CancellationToken) -> Result<()> {
    match &cli.command {
        Command::Wrap(cmd) => {
            let session = cli.session(
                cancel,
                cmd.max_retries,
                cmd.registry_username.clone(),
                cmd.registry_password.clone(),
            );
            let options = WrapOptions {
                output: cmd.output.clone(),
                lock: cli.lock_options(&cmd.platform),
                fetch_artifacts: cmd.fetch_artifacts,
                skip_images: cmd.skip_images,
                carvel_bundle: cmd.add_carvel_bundle,
                carvel_platform: cmd.carvel_platform.clone(),
            };
            wrap(&session, &cmd.chart, &options).await?;
        }
        Command::Unwrap(cmd) => {
            let session = cli.session(
                cancel,
                cmd.max_retries,
                cmd.registry_username.clone(),
                cmd.registry_password.clone(),
            );
            let options = UnwrapOptions {
                annotations_key: cli.annotations_key.clone(),
                values_files: cmd.values.clone(),
                yes: cmd.yes,
                push_chart_url: cmd.push_chart_url.clone(),
                skip_images: cmd.skip_images,
            };
            let unwrapped = unwrap(&session, &cmd.wrap, &cmd.registry, &options, confirm).await?;
            match unwrapped.chart {
                Some(chart) => write::ok("Done", format!("chart available at oci://{}", chart))?,
                None => write::ok("Done", "chart not pushed")?,
            }
        }
        Command::Info(cmd) => {
            let summary = info(&cmd.wrap)?;
            let mut stdout = io::stdout().lock();
            if cmd.yaml {
                match &summary.lock {
                    Some(lock) => write!(stdout, "{}", lock.to_yaml()?)?,
                    None => bail!("`{}` holds no {}", cmd.wrap.display(), LOCK_FILE),
                }
            } else {
                write!(stdout, "{}", summary)?;
            }
        }
        Command::Charts(ChartsCmd { command }) => match command {
            ChartsCommand::Annotate(cmd) => {
                let count = annotate(&cmd.chart, &cli.annotations_key)?;
                if count == 0 {
                    write::warn("Annotate", "no container images found")?;
                } else {
                    write::ok("Annotated", format!("{} images in {}", count, cmd.chart.display()))?;
                }
            }
            ChartsCommand::Relocate(cmd) => {
                let mut values_files = vec![PathBuf::from(VALUES_FILE)];
                values_files.extend(cmd.values.iter().cloned());
                let options = RelocateOptions {
                    annotations_key: cli.annotations_key.clone(),
                    values_files,
                    ..Default::default()
                };
                relocate_chart(&cmd.chart, &cmd.prefix, &options)?;
                write::ok("Relocated", format!("{} to {}", cmd.chart.display(), cmd.prefix))?;
            }
        },
        Command::Images(ImagesCmd { command }) => images(cli, command, cancel).await?,
        Command::Auth(AuthCmd { command }) => auth(command)?,
        Command::Version(_) => println!("helmwrap {}", env!("CARGO_PKG_VERSION")),
    }
    Ok(())
}

async fn images(cli: &Cli, command: &ImagesCommand, cancel: &CancellationToken) -> Result<()> {
    match command {
        ImagesCommand::Lock(cmd) => {
            let session = cli.session(cancel, cmd.max_retries, None, None);
            let lock = generate(&session, &cmd.chart, &cli.lock_options(&cmd.platform)).await?;
            let path = cmd.output.clone().unwrap_or_else(|| cmd.chart.join(LOCK_FILE));
            lock.to_path(&path)?;
            write::ok("Locked", format!("{} images in {}", lock.images.len(), path.display()))?;
        }
        ImagesCommand::Verify(cmd) => {
            let session = cli.session(cancel, cmd.max_retries, None, None);
            let path = cmd.lock.clone().unwrap_or_else(|| cmd.chart.join(LOCK_FILE));
            let lock = ImagesLock::from_path(&path)?;
            let live = generate(&session, &cmd.chart, &cli.lock_options(&cmd.platform)).await?;
            lock.validate(&live)
                .context(format!("`{}` does not match the registries", path.display()))?;
            write::ok("Verified", format!("{} images", lock.images.len()))?;
        }
        ImagesCommand::Pull(cmd) => {
            let session = cli.session(cancel, cmd.max_retries, None, None);
            let lock = ImagesLock::from_path(&cmd.chart.join(LOCK_FILE))?;
            let options = TransportOptions {
                fetch_artifacts: cmd.artifacts_dir.is_some(),
                artifacts_dir: cmd.artifacts_dir.clone(),
            };
            pull_images(&session, &lock, &cmd.output_dir, &options).await?;
            write::ok("Pulled", format!("{} images into {}", lock.images.len(), cmd.output_dir.display()))?;
        }
        ImagesCommand::Push(cmd) => {
            let session = cli.session(cancel, cmd.max_retries, None, None);
            let lock = ImagesLock::from_path(&cmd.chart.join(LOCK_FILE))?;
            let options = TransportOptions {
                fetch_artifacts: cmd.artifacts_dir.is_some(),
                artifacts_dir: cmd.artifacts_dir.clone(),
            };
            push_images(&session, &lock, &cmd.images_dir, &options).await?;
            write::ok("Pushed", format!("{} images", lock.images.len()))?;
        }
    }
    Ok(())
}

fn auth(command: &AuthCommand) -> Result<()> {
    let mut config = DockerConfig::load_default()?;
    match command {
        AuthCommand::Login(cmd) => {
            let password = match (&cmd.password, cmd.password_stdin) {
                (Some(_), true) => bail!("--password and --password-stdin are mutually exclusive"),
                (Some(password), false) => password.clone(),
                (None, true) => {
                    let mut password = String::new();
                    io::stdin()
                        .read_to_string(&mut password)
                        .context("Failed to read the password from stdin")?;
                    password.trim_end_matches(['\n', '\r']).to_string()
                }
                (None, false) => bail!("a password is required, use --password or --password-stdin"),
            };
            config.set(&cmd.server, &cmd.username, &password);
            config.save()?;
            write::ok("Login", format!("credentials for {} stored in {}", cmd.server, config.path().display()))?;
        }
        AuthCommand::Logout(cmd) => {
            if config.remove(&cmd.server) {
                config.save()?;
                write::ok("Logout", format!("removed credentials for {}", cmd.server))?;
            } else {
                write::warn("Logout", format!("not logged in to {}", cmd.server))?;
            }
        }
    }
    Ok(())
}

/// Ask a yes/no question on the terminal; anything but yes is no.
fn confirm(question: &str) -> Result<bool> {
    let mut stderr = io::stderr();
    write!(stderr, "{} [y/N] ", question)?;
    stderr.flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
