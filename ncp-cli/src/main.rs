// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc};

use ti_ncp::{
    control::{ControlLines, ControlPreset, HttpLines, Line, Sequencer, UrlContext, DEFAULT_BRIDGE},
    link::{relay::RelayLink, serial::SerialLink, ByteLink},
    mt::Znp,
    Device, Family,
};

use anyhow::{bail, Context, Result};
use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};

mod flash;
mod nvram;

#[cfg(unix)]
const DEFAULT_PORT: &str = "/dev/ttyACM0";
#[cfg(windows)]
const DEFAULT_PORT: &str = "COM0";

const LOG_ENV: &str = "TI_NCP_LOG";

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli().get_matches();

    init_logger(args.occurrences_of("verbose"));

    // Sanity checks first
    if args.is_present("relay") && !(args.is_present("host") && args.is_present("tcp-port")) {
        bail!("--relay needs --host and --tcp-port. See --help for more information");
    }

    if args.is_present("bsl-url") != args.is_present("rst-url") {
        bail!("--bsl-url and --rst-url must be used together. See --help for more information");
    }

    if args.is_present("pin-mode") && !args.is_present("bsl-url") {
        bail!("--pin-mode can't be used if --bsl-url is not specified. See --help for more information");
    }

    if args.is_present("swap-lines") && args.is_present("pin-mode") {
        bail!("--swap-lines can't be used with --pin-mode");
    }

    let global_args = GlobalArgs::from_matches(&args)?;

    match &global_args.target {
        Target::Serial { port, baudrate } => {
            log::info!("Opening serial port `{}`", port.display());
            log::info!("Baudrate: {}", baudrate);
            let link = Arc::new(SerialLink::open(port, *baudrate).with_context(|| {
                format!("Couldn't open serial port `{}`", port.display())
            })?);

            let lines: Arc<dyn ControlLines> = link.clone();
            let control = global_args.control(Some(lines))?;
            run(&args, &global_args, link, control).await
        }
        Target::Relay { ws_base, host, port } => {
            let link = Arc::new(
                RelayLink::connect(ws_base, host, *port)
                    .await
                    .with_context(|| format!("Couldn't connect to {}:{} through {}", host, port, ws_base))?,
            );

            let control = global_args.control(None)?;
            run(&args, &global_args, link, control).await
        }
    }
}

fn init_logger(verbose: u64) {
    match verbose {
        0 if std::env::var_os(LOG_ENV).is_none() => std::env::set_var(LOG_ENV, "info"),
        0 => (),
        1 => std::env::set_var(LOG_ENV, "debug"),
        _ => std::env::set_var(LOG_ENV, "trace"),
    }

    #[cfg(feature = "pretty-env-logger")]
    pretty_env_logger::init_custom_env(LOG_ENV);
    #[cfg(not(feature = "pretty-env-logger"))]
    env_logger::init_from_env(LOG_ENV);
}

async fn run<L>(
    args: &ArgMatches<'_>,
    global_args: &GlobalArgs,
    link: Arc<L>,
    mut control: Control,
) -> Result<()>
where
    L: ByteLink + 'static,
{
    match args.subcommand() {
        ("bootloader", _) => control.enter_bootloader().await,
        ("reset", _) => control.reset().await,
        ("info", _) => {
            let mut device = open_bootloader(global_args, link, &mut control).await?;
            let info = flash::read_info(&mut device, global_args.family).await?;
            println!(
                "{} ({:#06X}), {} KB flash, IEEE {}",
                info.identity.model(),
                info.identity.chip_id,
                info.flash_size / 1024,
                ti_ncp::util::format_ieee_address(&info.ieee_address)
            );
            Ok(())
        }
        ("flash", Some(m)) => {
            let mut device = open_bootloader(global_args, link, &mut control).await?;
            let info = flash::read_info(&mut device, global_args.family).await?;
            flash::flash(m, &mut device, &info).await?;

            if !m.is_present("no-reset") {
                control.reset().await?;
            }
            Ok(())
        }
        ("ping", _) => nvram::ping(&Znp::new(link)).await,
        ("version", _) => nvram::version(&Znp::new(link)).await,
        ("nvram-read", Some(m)) => nvram::read(m, &Znp::new(link)).await,
        ("nvram-write", Some(m)) => nvram::write(m, &Znp::new(link)).await,
        ("nvram-erase", Some(m)) => nvram::erase(m, &Znp::new(link)).await,
        _ => {
            println!("Error: Sub-command required");
            println!("{}", args.usage());
            Ok(())
        }
    }
}

async fn open_bootloader<L>(
    global_args: &GlobalArgs,
    link: L,
    control: &mut Control,
) -> Result<Device<L>>
where
    L: ByteLink,
{
    if global_args.auto_bsl {
        control.enter_bootloader().await?;
    }

    log::info!("Initializing communications with the device");
    let mut device = Device::new(link);
    device
        .sync()
        .await
        .context("Failed to synchronize with the bootloader")?;

    log::info!("Pinging device");
    device
        .ping()
        .await
        .context("Ping command wasn't acknowledged")?;

    Ok(device)
}

enum Target {
    Serial {
        port: PathBuf,
        baudrate: usize,
    },
    Relay {
        ws_base: String,
        host: String,
        port: u16,
    },
}

struct GlobalArgs {
    target: Target,
    family: Option<Family>,
    auto_bsl: bool,
    swap_lines: bool,
    pin_mode: bool,
    bsl_url: Option<String>,
    rst_url: Option<String>,
    bridge: String,
    preset: Option<(String, String)>,
}

impl GlobalArgs {
    fn from_matches(args: &ArgMatches<'_>) -> Result<GlobalArgs> {
        let target = match args.value_of("relay") {
            Some(ws_base) => Target::Relay {
                ws_base: ws_base.to_string(),
                host: args.value_of("host").unwrap_or_default().to_string(),
                port: args
                    .value_of("tcp-port")
                    .unwrap_or_default()
                    .parse()
                    .context("Invalid TCP port")?,
            },
            None => Target::Serial {
                port: args.value_of("port").unwrap_or(DEFAULT_PORT).into(),
                baudrate: args
                    .value_of("baudrate")
                    .unwrap_or("115200")
                    .parse()
                    .context("Invalid baudrate")?,
            },
        };

        let family = match args.value_of("family") {
            Some(f) => Some(f.parse::<Family>().map_err(|_| {
                anyhow::anyhow!("Invalid family `{}`, use cc2538, cc26x0 or cc26x2", f)
            })?),
            None => None,
        };

        Ok(GlobalArgs {
            target,
            family,
            auto_bsl: !args.is_present("no-auto-bsl"),
            swap_lines: args.is_present("swap-lines"),
            pin_mode: args.is_present("pin-mode"),
            bsl_url: args.value_of("bsl-url").map(str::to_string),
            rst_url: args.value_of("rst-url").map(str::to_string),
            bridge: args.value_of("bridge").unwrap_or(DEFAULT_BRIDGE).to_string(),
            preset: args.value_of("preset").map(|t| {
                (
                    t.to_string(),
                    args.value_of("preset-protocol").unwrap_or("tcp").to_string(),
                )
            }),
        })
    }

    fn url_context(&self) -> UrlContext {
        let (host, port) = match &self.target {
            Target::Relay { host, port, .. } => (host.clone(), *port),
            Target::Serial { .. } => (String::new(), 0),
        };

        UrlContext {
            host,
            port,
            bridge: self.bridge.clone(),
        }
    }

    /// Pick the control line driver: explicit URLs, then a preset, then the
    /// serial port lines.
    fn control(&self, serial_lines: Option<Arc<dyn ControlLines>>) -> Result<Control> {
        if let (Some(bsl), Some(rst)) = (&self.bsl_url, &self.rst_url) {
            let lines = HttpLines::new(bsl.as_str(), rst.as_str(), self.url_context())?;
            return Ok(self.http_control(lines, self.pin_mode));
        }

        if let Some((device_type, protocol)) = &self.preset {
            let preset = match ControlPreset::find(device_type, protocol) {
                Some(preset) => preset,
                None => bail!("No control preset for `{}` over `{}`", device_type, protocol),
            };
            log::info!("Control preset: {}", preset.name);

            if preset.bsl.is_some() {
                let lines = HttpLines::from_preset(preset, self.url_context())?;
                return Ok(self.http_control(lines, preset.pin_mode));
            }
        }

        match serial_lines {
            Some(lines) => Ok(Control::Sequence(
                Sequencer::new(lines).swapped(self.swap_lines),
            )),
            None => {
                log::warn!("No control lines available, mode changes must be done by hand");
                Ok(Control::Manual)
            }
        }
    }

    fn http_control(&self, lines: HttpLines, pin_mode: bool) -> Control {
        if pin_mode {
            Control::Pin(lines)
        } else {
            let lines: Arc<dyn ControlLines> = Arc::new(lines);
            Control::Sequence(Sequencer::new(lines).swapped(self.swap_lines))
        }
    }
}

/// How the NCP is moved between bootloader and application.
enum Control {
    Sequence(Sequencer<Arc<dyn ControlLines>>),
    /// The device runs the pulse when its endpoint is hit.
    Pin(HttpLines),
    Manual,
}

impl Control {
    async fn enter_bootloader(&mut self) -> Result<()> {
        let result = match self {
            Control::Sequence(seq) => seq.enter_bootloader().await,
            Control::Pin(lines) => lines.trigger(Line::Bsl).await,
            Control::Manual => {
                log::info!("Skipping bootloader sequence");
                Ok(())
            }
        };

        result.context("Failed to invoke bootloader")
    }

    async fn reset(&mut self) -> Result<()> {
        let result = match self {
            Control::Sequence(seq) => seq.reset_to_application().await,
            Control::Pin(lines) => lines.trigger(Line::Rst).await,
            Control::Manual => {
                log::info!("Skipping reset sequence");
                Ok(())
            }
        };

        result.context("Failed to reset the device")
    }
}

fn cli() -> App<'static, 'static> {
    let app = App::new("TI NCP tool")
        .usage("ti-ncp [OPTIONS] [SUBCOMMAND]")
        .setting(AppSettings::ColoredHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about("Bootloader programmer and NVRAM backup tool for Texas Instruments network co-processors")
        .arg(
            opt("port", "Serial port to use")
                .short("p")
                .takes_value(true)
                .conflicts_with("relay")
        )
        .arg(
            opt("baudrate", "Serial port baudrate")
                .short("b")
                .takes_value(true)
                .default_value("115200")
        )
        .arg(
            opt("relay", "WebSocket bridge relaying a remote serial port, e.g.: ws://127.0.0.1:8765")
                .takes_value(true)
        )
        .arg(opt("host", "Host of the remote serial port (with --relay)").takes_value(true))
        .arg(opt("tcp-port", "TCP port of the remote serial port (with --relay)").takes_value(true))
        .arg(
            opt("family", "Family: cc2538, cc26x0, cc26x2. Detected from the chip ID by default")
                .takes_value(true)
        )
        .arg(
            opt(
                "swap-lines",
                "Start with the RESET and bootloader lines swapped. A failing sequence is always retried once with the other order"
            )
        )
        .arg(
            opt(
                "bsl-url",
                "URL template driving the bootloader line, {SET} is replaced by the level (0 low, 1 high), {HOST}, {PORT} and {BRIDGE} by the connection"
            )
                .takes_value(true)
        )
        .arg(opt("rst-url", "URL template driving the RESET line, see --bsl-url").takes_value(true))
        .arg(
            opt(
                "pin-mode",
                "The device runs the bootloader and reset pulses itself, send a single request to --bsl-url or --rst-url"
            )
        )
        .arg(
            opt("bridge", "Bridge address used for {BRIDGE}")
                .takes_value(true)
                .default_value(DEFAULT_BRIDGE)
        )
        .arg(
            opt("preset", "Use the control URLs of a known device type: zigstar_gw, uzg-01, xzg, tubeszb, local")
                .takes_value(true)
        )
        .arg(
            opt("preset-protocol", "Protocol of --preset: tcp, usb, serial")
                .takes_value(true)
                .default_value("tcp")
        )
        .arg(opt("no-auto-bsl", "Don't run the bootloader sequence before bootloader commands"))
        .arg(
            opt("verbose", "Use verbose output: -v (debug), -vv (trace)")
                .short("v")
                .multiple(true)
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Show the chip model, flash size and IEEE address")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("flash")
                .about("Flash a binary file")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("BIN")
                        .required(true)
                        .takes_value(true)
                        .help("Binary file to flash")
                )
                .arg(
                    opt(
                        "address",
                        "Address in memory where the binary contents will be flashed, defaults to the flash base"
                    )
                        .short("a")
                        .takes_value(true)
                )
                .arg(
                    opt(
                        "write-erase",
                        "Erase first before writing the binary contents, this will bank erase the device when supported or erase the range covered by the binary"
                    )
                        .short("e")
                )
                .arg(opt("no-verify", "Don't compare the CRC32 of the flash with the binary"))
                .arg(opt("no-reset", "Stay in the bootloader after flashing"))
                .arg(
                    opt(
                        "force",
                        "Force the write of the CCFG. Warning: may lock yourself out of the device."
                    )
                        .short("f")
                )
        )
        .subcommand(
            SubCommand::with_name("bootloader")
                .about("Put the device in bootloader mode")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Reset the device into the application")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("ping")
                .about("Ping the Z-Stack application")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("version")
                .about("Show the Z-Stack firmware version")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("nvram-read")
                .about("Back up the NVRAM to a JSON file")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("OUT")
                        .required(true)
                        .takes_value(true)
                        .help("Backup file to write")
                )
        )
        .subcommand(
            SubCommand::with_name("nvram-write")
                .about("Restore the NVRAM from a JSON backup")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("IN")
                        .required(true)
                        .takes_value(true)
                        .help("Backup file to restore")
                )
        )
        .subcommand(
            SubCommand::with_name("nvram-erase")
                .about("Erase the NVRAM")
                .setting(AppSettings::ColoredHelp)
                .arg(opt("yes", "Confirm the erase").short("y"))
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    app
}

fn opt(name: &'static str, help: &'static str) -> Arg<'static, 'static> {
    Arg::with_name(name).long(name).help(help)
}
