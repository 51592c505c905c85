use std::env;
use std::future::Future;
use std::path::PathBuf;

use anyhow::Context as _;
use seahorse::{App, Command, Context, Flag, FlagType};
use ssh1_mux::{ActiveProxy, FtpConfig, Target};
use sshtun::forward::ForwardSpec;
use sshtun::transport::TransportMode;
use tokio::runtime;

#[macro_use]
extern crate tracing;

const DEFAULT_LOG_FILTER: &str = "info";
const LOG_FILTER_ENV_VAR: &str = "SSHTUN_LOG";

fn main() {
    let args: Vec<String> = if let Ok(args_str) = env::var("SSHTUN_ARGS") {
        env::args()
            .take(1)
            .chain(parse_env_variable_as_args(&args_str))
            .collect()
    } else {
        env::args().collect()
    };

    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(generate_usage())
        .command(connect_command());

    app.run(args);
}

fn generate_usage() -> String {
    format!(
        "{command} [action]\n\
        \n\
        \tExample: forward a local port to an intranet web server\n\
        \n\
        \t  {command} connect tcp://127.0.0.1:2222 local://127.0.0.1:8080/intranet:80\n\
        \n\
        Log verbosity is controlled with the {env_var} environment variable (default: {default_filter}).",
        command = env!("CARGO_PKG_NAME"),
        env_var = LOG_FILTER_ENV_VAR,
        default_filter = DEFAULT_LOG_FILTER,
    )
}

fn run<F: Future<Output = anyhow::Result<u32>>>(f: F) -> anyhow::Result<u32> {
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("runtime build failed")?;

    let result = rt.block_on(f);

    match &result {
        Ok(status) => info!(status, "Terminated successfully"),
        Err(error) => error!(error = format!("{error:#}"), "Terminated with an error"),
    }

    // Standard input is read from a blocking thread which never returns on its own.
    rt.shutdown_timeout(core::time::Duration::from_millis(100));

    result
}

fn exit(res: anyhow::Result<u32>) -> ! {
    match res {
        Ok(status) => std::process::exit(i32::try_from(status).unwrap_or(i32::MAX)),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(1);
        }
    }
}

const TRANSPORT_FORMATS: &str = r#"Transport formats:
    `tcp://<ADDRESS>`: Connect to the peer
    `tcp-listen://<BINDING ADDRESS>`: Wait for the peer to connect

Forward formats:
    `local://<BINDING ADDRESS>/<DESTINATION>[?plugin=<PLUGIN>]`: Listen locally, connections are opened by the peer
    `remote://<SERVER PORT>/<DESTINATION>[?plugin=<PLUGIN>]`: The peer listens, connections are opened locally

Plugins:
    `general`: Payload is forwarded untouched (default)
    `ftp`: Passive and active mode data connections are tunneled as well"#;

// connect

const CONNECT_SUBCOMMAND: &str = "connect";

fn connect_command() -> Command {
    let usage = format!(
        r##"{command} {subcommand} <TRANSPORT> [<FORWARD> ...]

{formats}

Example: intranet web server and FTP server

    {command} {subcommand} tcp://127.0.0.1:2222 local://127.0.0.1:8080/intranet:80 local://127.0.0.1:2121/ftp.intranet:21?plugin=ftp

Example: expose a local development server on the remote side

    {command} {subcommand} tcp://127.0.0.1:2222 remote://9000/127.0.0.1:3000"##,
        command = env!("CARGO_PKG_NAME"),
        subcommand = CONNECT_SUBCOMMAND,
        formats = TRANSPORT_FORMATS,
    );

    let cmd = Command::new(CONNECT_SUBCOMMAND)
        .description("Run a session over an SSH1 packet stream and forward ports through it")
        .alias("c")
        .usage(usage)
        .action(connect_action);

    apply_connect_flags(apply_common_flags(cmd))
}

fn connect_action(c: &Context) {
    let res = ConnectArgs::parse(c).and_then(|args| {
        let _log_guard = setup_logger(&args.common.logging)?;

        let cfg = sshtun::ConnectCfg {
            transport_mode: args.transport_mode,
            forwards: args.forwards,
            x11_target: args.x11_target,
            ftp: args.ftp,
            transport_timeout: args.common.timeout,
        };

        run(sshtun::connect(cfg))
    });

    exit(res);
}

// args parsing

fn parse_env_variable_as_args(env_var_str: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut arg = String::new();
    let mut quote = None;

    for c in env_var_str.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => arg.push(c),
            (None, '"' | '\'') => quote = Some(c),
            (None, ' ') => {
                if !arg.is_empty() {
                    args.push(core::mem::take(&mut arg));
                }
            }
            (None, c) => arg.push(c),
        }
    }

    if !arg.is_empty() {
        args.push(arg);
    }

    args
}

fn apply_common_flags(cmd: Command) -> Command {
    cmd.flag(Flag::new("log-file", FlagType::String).description("Specify filepath for log file"))
        .flag(Flag::new("log-term", FlagType::Bool).description("Print logs to stderr instead of log file"))
        .flag(Flag::new("timeout", FlagType::String).description("Timeout when opening the transport"))
}

#[derive(Debug)]
enum Logging {
    Term,
    File { filepath: PathBuf },
}

struct CommonArgs {
    logging: Logging,
    timeout: Option<core::time::Duration>,
}

impl CommonArgs {
    fn parse(action: &str, c: &Context) -> anyhow::Result<Self> {
        let logging = if c.bool_flag("log-term") {
            Logging::Term
        } else if let Ok(filepath) = c.string_flag("log-file") {
            let filepath = PathBuf::from(filepath);
            Logging::File { filepath }
        } else if let Some(mut filepath) = dirs_next::data_dir() {
            use std::time::{SystemTime, UNIX_EPOCH};
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .context("couldn't retrieve duration since UNIX epoch")?;
            filepath.push(env!("CARGO_PKG_NAME"));
            std::fs::create_dir_all(&filepath).context("couldn't create log folder")?;
            filepath.push(format!("{}_{}", action, now.as_secs()));
            filepath.set_extension("log");
            Logging::File { filepath }
        } else {
            eprintln!("Couldn't retrieve data directory for log files. Enabling --log-term flag implicitly.");
            Logging::Term
        };

        let timeout = if let Ok(timeout) = c.string_flag("timeout") {
            let timeout = humantime::parse_duration(&timeout).context("invalid value for timeout")?;
            Some(timeout)
        } else {
            None
        };

        Ok(Self { logging, timeout })
    }
}

fn apply_connect_flags(cmd: Command) -> Command {
    cmd.flag(Flag::new("x11", FlagType::String).description("Forward X11 connections to the given display server <HOST:PORT>"))
        .flag(
            Flag::new("ftp-active-proxy", FlagType::String)
                .description("Remote address <IP:PORT> advertised in active mode FTP commands"),
        )
        .flag(
            Flag::new("ftp-forward-host", FlagType::String)
                .description("Host name the peer opens active mode FTP data connections to [default = ftp-data]"),
        )
}

struct ConnectArgs {
    common: CommonArgs,
    transport_mode: TransportMode,
    forwards: Vec<ForwardSpec>,
    x11_target: Option<Target>,
    ftp: FtpConfig,
}

impl ConnectArgs {
    fn parse(c: &Context) -> anyhow::Result<Self> {
        let common = CommonArgs::parse(CONNECT_SUBCOMMAND, c)?;

        let arg_transport = c.args.first().context("<TRANSPORT> is missing")?;
        let transport_mode = TransportMode::parse_str(arg_transport).context("bad <TRANSPORT>")?;

        let forwards = c
            .args
            .iter()
            .skip(1)
            .map(|arg| ForwardSpec::parse_str(arg).with_context(|| format!("bad <FORWARD>: `{arg}`")))
            .collect::<anyhow::Result<Vec<ForwardSpec>>>()?;

        let x11_target = if let Ok(display) = c.string_flag("x11") {
            Some(Target::parse_str(&display).context("bad X11 display address")?)
        } else {
            None
        };

        let active_proxy = if let Ok(advertised) = c.string_flag("ftp-active-proxy") {
            let advertised = advertised.parse().context("bad FTP active mode proxy address")?;
            let forward_host = c
                .string_flag("ftp-forward-host")
                .unwrap_or_else(|_| "ftp-data".to_owned());

            Some(ActiveProxy {
                advertised,
                forward_host,
            })
        } else {
            None
        };

        Ok(Self {
            common,
            transport_mode,
            forwards,
            x11_target,
            ftp: FtpConfig { active_proxy },
        })
    }
}

// logging

fn setup_logger(logging: &Logging) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use std::fs::OpenOptions;
    use std::panic;

    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let (non_blocking, guard) = match logging {
        // Standard output carries the remote command output.
        Logging::Term => tracing_appender::non_blocking(std::io::stderr()),
        Logging::File { filepath } => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(filepath)
                .with_context(|| format!("couldn't open log file {}", filepath.display()))?;
            tracing_appender::non_blocking(file)
        }
    };

    let fmt_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(matches!(logging, Logging::Term));

    let env_filter = EnvFilter::try_from_env(LOG_FILTER_ENV_VAR)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("invalid log filtering directives")?;

    tracing_subscriber::registry().with(fmt_layer).with(env_filter).init();

    panic::set_hook(Box::new(move |panic_info| {
        error!(%panic_info);
        eprintln!("{panic_info}");
    }));

    info!(version = env!("CARGO_PKG_VERSION"), "Logger initialized");

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_variable_args() {
        assert_eq!(
            vec![
                "connect".to_owned(),
                "tcp://127.0.0.1:2222".to_owned(),
                "--log-file".to_owned(),
                "/tmp/my logs/sshtun.log".to_owned(),
                "--timeout".to_owned(),
                "5s".to_owned(),
            ],
            parse_env_variable_as_args(r#"connect tcp://127.0.0.1:2222  --log-file "/tmp/my logs/sshtun.log" --timeout '5s'"#)
        );
    }

    #[test]
    fn empty_env_variable() {
        assert!(parse_env_variable_as_args("").is_empty());
        assert!(parse_env_variable_as_args("   ").is_empty());
    }
}
