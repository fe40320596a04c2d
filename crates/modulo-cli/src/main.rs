/*!
 * Modulo host tool.
 *
 * Runs the host main loop over a simulated bus described by a topology
 * file, lists the devices present on it, or prints the effective
 * configuration.
 */
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use tokio::signal;
use tokio::time;
use tracing::{debug, info, warn};

use modulo_core::clock::SystemClock;
use modulo_core::config::{Config, ConfigBuilder};
use modulo_core::logging;
use modulo_devices::devices::{display, io, knob};
use modulo_devices::protocols::{SimulatedBus, Topology};
use modulo_devices::{
    BusContext, DiscoveredDevice, DisplayModule, Driver, HandleKey, IoModule, KnobModule,
};

const ENV_PREFIX: &str = "MODULO";

type HostContext = BusContext<SimulatedBus, SystemClock>;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = App::new("modulo")
        .version(modulo_devices::VERSION)
        .about("Modulo peripheral bus host")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("topology")
                .short("t")
                .long("topology")
                .value_name("FILE")
                .help("Simulated bus topology (TOML or JSON)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log at debug level")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the host main loop")
                .arg(
                    Arg::with_name("ticks")
                        .long("ticks")
                        .value_name("N")
                        .help("Stop after N iterations (0 runs until Ctrl-C)")
                        .takes_value(true)
                        .validator(is_number),
                )
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .value_name("MS")
                        .help("Milliseconds between iterations")
                        .takes_value(true)
                        .validator(is_number),
                ),
        )
        .subcommand(
            SubCommand::with_name("scan")
                .about("Reset the bus and list every device on it")
                .after_help("Addresses are unassigned right after the reset, so the table omits them.")
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .value_name("FORMAT")
                        .possible_values(&["table", "json"])
                        .default_value("table")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("config").about("Print the effective configuration"))
        .get_matches();

    let config = load_config(&matches)?;
    logging::init_from_config(&config.logging).context("Failed to initialize logging")?;
    debug!(version = modulo_devices::VERSION, "Starting");

    match matches.subcommand() {
        ("run", _) => run(config).await,
        ("scan", Some(sub)) => scan(&config, sub.value_of("format").unwrap_or("table")),
        ("config", _) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_number(value: String) -> std::result::Result<(), String> {
    value
        .parse::<u64>()
        .map(|_| ())
        .map_err(|_| format!("'{}' is not a number", value))
}

fn load_config(matches: &ArgMatches) -> Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix(ENV_PREFIX);
    if let Some(path) = matches.value_of("config") {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build()?;

    if let Some(path) = matches.value_of("topology") {
        config.host.topology = Some(path.into());
    }
    if matches.is_present("verbose") {
        config.logging.level = "debug".to_string();
    }
    if let Some(sub) = matches.subcommand_matches("run") {
        if let Some(ticks) = sub.value_of("ticks") {
            config.host.max_ticks = ticks.parse()?;
        }
        if let Some(interval) = sub.value_of("interval") {
            config.host.loop_interval_ms = interval.parse()?;
        }
    }

    config.validate()?;
    Ok(config)
}

fn open_bus(config: &Config) -> Result<(HostContext, Topology)> {
    let path = config
        .host
        .topology
        .as_deref()
        .ok_or_else(|| anyhow!("No bus topology configured; pass --topology or set host.topology"))?;
    let topology = load_topology(path)?;
    let bus = SimulatedBus::from_topology(&topology);
    Ok((BusContext::from_config(bus, SystemClock::new(), &config.bus), topology))
}

fn load_topology(path: &Path) -> Result<Topology> {
    Topology::load(path).with_context(|| format!("Failed to load topology {}", path.display()))
}

/// Modules owned by the host loop
#[derive(Debug, Default)]
struct Attached {
    io: Vec<IoModule>,
    displays: Vec<DisplayModule>,
    knobs: Vec<KnobModule>,
    generic: Vec<HandleKey>,
}

impl Attached {
    fn release(self, ctx: &mut HostContext) {
        self.io.into_iter().for_each(|module| module.release(ctx));
        self.displays.into_iter().for_each(|module| module.release(ctx));
        self.knobs.into_iter().for_each(|module| module.release(ctx));
        for key in self.generic {
            ctx.detach(key);
        }
    }
}

/// Register one handle per topology device so the sweep brings them up
fn attach_all(ctx: &mut HostContext, topology: &Topology) -> Result<Attached> {
    let mut attached = Attached::default();
    for device in &topology.devices {
        let id = device.device_id;
        match device.device_type.as_str() {
            io::DEVICE_TYPE => {
                attached.io.push(IoModule::with_device_id(ctx, id)?);
            }
            display::DEVICE_TYPE => {
                attached.displays.push(DisplayModule::with_device_id(ctx, id)?);
            }
            knob::DEVICE_TYPE => {
                let module = KnobModule::with_device_id(ctx, id)?;
                module.on_button_press(ctx, move |s| {
                    info!(device_id = %id, position = s.position, "Knob pressed")
                })?;
                module.on_button_release(ctx, move |s| {
                    info!(device_id = %id, position = s.position, "Knob released")
                })?;
                module.on_position_change(ctx, move |s| {
                    info!(device_id = %id, position = s.position, "Knob turned")
                })?;
                attached.knobs.push(module);
            }
            other => {
                attached.generic.push(ctx.attach_device(other, id, Driver::Generic)?);
            }
        }
    }
    Ok(attached)
}

async fn run(config: Config) -> Result<()> {
    let (mut ctx, topology) = open_bus(&config)?;
    let attached = attach_all(&mut ctx, &topology)?;

    let max_ticks = config.host.max_ticks;
    let mut interval = time::interval(Duration::from_millis(config.host.loop_interval_ms));
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        devices = topology.devices.len(),
        interval_ms = config.host.loop_interval_ms,
        max_ticks,
        "Host loop started"
    );

    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = ctx.tick();
                if report.connected > 0 || report.events > 0 {
                    debug!(connected = report.connected, events = report.events, "Tick");
                }
                ticks += 1;
                if max_ticks != 0 && ticks >= max_ticks {
                    break;
                }
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Interrupted");
                break;
            }
        }
    }

    let connected = ctx
        .registry()
        .iter()
        .filter(|(_, handle)| handle.is_connected())
        .count();
    info!(ticks, connected, handles = ctx.registry().len(), "Host loop stopped");
    attached.release(&mut ctx);
    Ok(())
}

fn scan(config: &Config, format: &str) -> Result<()> {
    let (mut ctx, _) = open_bus(config)?;
    let devices = ctx.enumerate()?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    print!("{}", device_table(&devices));
    Ok(())
}

fn device_table(devices: &[DiscoveredDevice]) -> String {
    let mut table = format!("{:<8} {}\n", "ID", "TYPE");
    for device in devices {
        table.push_str(&format!(
            "{:<8} {}\n",
            device.device_id.raw(),
            device.device_type.as_deref().unwrap_or("?")
        ));
    }
    table.push_str(&format!("{} device(s)\n", devices.len()));
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use modulo_core::types::{BusAddress, DeviceId};

    #[test]
    fn test_device_table_lists_id_and_type() {
        let devices = vec![
            DiscoveredDevice {
                device_id: DeviceId::new(3),
                device_type: Some(io::DEVICE_TYPE.to_string()),
                address: Some(BusAddress::new(10)),
                claimed: false,
            },
            DiscoveredDevice {
                device_id: DeviceId::new(7),
                device_type: None,
                address: None,
                claimed: false,
            },
        ];

        let table = device_table(&devices);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines[0].split_whitespace().collect::<Vec<_>>(), ["ID", "TYPE"]);
        assert_eq!(
            lines[1].split_whitespace().collect::<Vec<_>>(),
            ["3", io::DEVICE_TYPE]
        );
        assert_eq!(lines[2].split_whitespace().collect::<Vec<_>>(), ["7", "?"]);
        assert_eq!(lines[3], "2 device(s)");
    }

    #[test]
    fn test_attached_modules_are_released() {
        let topology = Topology::from_toml_str(
            r#"
            [[devices]]
            device_id = 1
            device_type = "co.modulo.io"

            [[devices]]
            device_id = 2
            device_type = "co.modulo.knob"

            [[devices]]
            device_id = 3
            device_type = "co.modulo.colordisplay"

            [[devices]]
            device_id = 4
            device_type = "co.example.thermometer"
            "#,
        )
        .unwrap();
        let bus = SimulatedBus::from_topology(&topology);
        let mut ctx = BusContext::new(bus, SystemClock::new(), Default::default());

        let attached = attach_all(&mut ctx, &topology).unwrap();
        assert_eq!(ctx.registry().len(), 4);
        assert_eq!(attached.generic.len(), 1);

        attached.release(&mut ctx);
        assert_eq!(ctx.registry().len(), 0);
    }
}
