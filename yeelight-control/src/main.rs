use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use log::debug;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use yeelight_control_lib::control_interface::router::DeviceEvent;
use yeelight_control_lib::control_interface::{
    CliColors, ConnectionOptions, ControlInterface, Effect, PowerState, DEFAULT_PORT, RGB,
};
use yeelight_control_lib::util::cache::DeviceCache;
use yeelight_control_lib::util::discovery::{DeviceRecord, Discovery};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Controls Yeelight smart lights on the local network",
    version
)]
pub struct Cli {
    /// Path of the device cache (defaults to the user cache directory)
    #[clap(long, global = true)]
    pub cache: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for device listings.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// IP address or host name of the device
        #[clap(long)]
        ip: String,

        /// Control port of the device
        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Connect and command timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 5000)]
        timeout: u64,

        /// Fade changes over this many milliseconds instead of applying them at once
        #[clap(long, global = true)]
        smooth: Option<u64>,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches the local network for devices
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value_t = 3000)]
        timeout: u64,

        /// Neither read nor update the device cache
        #[clap(long)]
        no_cache: bool,
    },
    /// Lists the cached devices without searching
    #[clap(name = "list")]
    List {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,
    },
    /// Adds a device to the cache, e.g. one on another subnet
    #[clap(name = "add-device")]
    AddDevice {
        ip: Ipv4Addr,

        #[clap(long, default_value_t = DEFAULT_PORT)]
        port: u16,

        #[clap(long)]
        name: Option<String>,
    },
    /// Removes a device from the cache
    #[clap(name = "remove-device")]
    RemoveDevice { ip: Ipv4Addr },
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Switches the device on.
    #[clap(name = "on")]
    On,
    /// Switches the device off.
    #[clap(name = "off")]
    Off,
    /// Toggles power.
    #[clap(name = "toggle")]
    Toggle,
    /// Prints the power state.
    #[clap(name = "get-power")]
    GetPower,
    /// Sets brightness in percent (1-100).
    #[clap(name = "set-brightness")]
    SetBrightness { brightness: i32 },
    /// Sets a color by name or by components.
    #[clap(name = "set-color")]
    SetColor {
        /// The color to display by name
        #[clap(value_enum)]
        color: Option<CliColors>,

        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,
    },
    /// Sets hue (0-359) and saturation (0-100).
    #[clap(name = "set-hsv")]
    SetHsv { hue: i32, saturation: i32 },
    /// Sets the color temperature in kelvin (1700-6500).
    #[clap(name = "set-temperature")]
    SetTemperature { kelvin: i32 },
    /// Renames the device.
    #[clap(name = "set-name")]
    SetName { name: String },
    /// Saves the current state as the power-on default.
    #[clap(name = "set-default")]
    SetDefault,
    /// Prints the given properties, e.g. `power bright ct rgb`.
    #[clap(name = "get-prop")]
    GetProp {
        #[clap(required = true)]
        properties: Vec<String>,
    },
    /// Sends an arbitrary method with a JSON array of parameters.
    #[clap(name = "raw")]
    Raw {
        method: String,
        #[clap(default_value = "[]")]
        params: String,
    },
    /// Prints notifications pushed by the device.
    #[clap(name = "listen")]
    Listen {
        /// How long to listen, in seconds
        #[clap(long, default_value_t = 60)]
        seconds: u64,
    },
}

fn default_cache_path() -> PathBuf {
    ProjectDirs::from("org", "cgorski", "yeelight-control")
        .map(|dirs| dirs.cache_dir().join("devices.json"))
        .unwrap_or_else(|| PathBuf::from("yeelight-devices.json"))
}

fn print_devices(devices: &[DeviceRecord], output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Plaintext => {
            Discovery::pretty_print_devices(devices);
        }
        OutputFormat::Json => {
            let json = serde_json::to_string(devices)?;
            println!("{}", json);
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(devices)?;
            println!("{}", yaml);
        }
    }
    Ok(())
}

async fn listen(control: &ControlInterface, seconds: u64) -> Result<()> {
    let mut events = control.subscribe();
    let listening = async {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Notification(notification)) => {
                    println!("{}: {}", notification.method, notification.params);
                }
                Ok(DeviceEvent::Disconnected) | Err(RecvError::Closed) => {
                    return Err(anyhow!("Device closed the connection"));
                }
                Ok(DeviceEvent::Error(error)) => {
                    return Err(anyhow!("Connection failed: {}", error));
                }
                Ok(DeviceEvent::Connected) => {}
                Err(RecvError::Lagged(missed)) => debug!("Missed {} notifications", missed),
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(seconds), listening).await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

async fn handle_device_action(
    control: &ControlInterface,
    action: DeviceAction,
    effect: Effect,
) -> Result<()> {
    match action {
        DeviceAction::On => {
            control.set_power(PowerState::On, effect).await?;
            println!("Device switched on.");
        }
        DeviceAction::Off => {
            control.set_power(PowerState::Off, effect).await?;
            println!("Device switched off.");
        }
        DeviceAction::Toggle => {
            control.toggle().await?;
            println!("Device toggled.");
        }
        DeviceAction::GetPower => {
            println!("Power: {}", control.get_power().await?);
        }
        DeviceAction::SetBrightness { brightness } => {
            control.set_brightness(brightness, effect).await?;
            println!("Brightness set to {}%", brightness);
        }
        DeviceAction::SetColor {
            color,
            red,
            green,
            blue,
        } => {
            let color_to_show = match (color, red, green, blue) {
                (Some(color_name), None, None, None) => color_name.into(),
                (None, Some(r), Some(g), Some(b)) => RGB::new(r, g, b),
                _ => return Err(anyhow!("Invalid color specification")),
            };
            control.set_rgb(color_to_show, effect).await?;
            println!("Displayed color: {:?}", color_to_show);
        }
        DeviceAction::SetHsv { hue, saturation } => {
            control.set_hsv(hue, saturation, effect).await?;
            println!("Hue set to {}, saturation to {}", hue, saturation);
        }
        DeviceAction::SetTemperature { kelvin } => {
            control.set_color_temperature(kelvin, effect).await?;
            println!("Color temperature set to {}K", kelvin);
        }
        DeviceAction::SetName { name } => {
            control.set_name(&name).await?;
            println!("Device renamed to {}", name);
        }
        DeviceAction::SetDefault => {
            control.set_default().await?;
            println!("Current state saved as default.");
        }
        DeviceAction::GetProp { properties } => {
            let names: Vec<&str> = properties.iter().map(String::as_str).collect();
            let values = control.get_properties(&names).await?;
            for name in names {
                println!("{}: {}", name, values.get(name).map_or("", String::as_str));
            }
        }
        DeviceAction::Raw { method, params } => {
            let params: Vec<Value> =
                serde_json::from_str(&params).context("Parameters must be a JSON array")?;
            let result = control.send(&method, params).await?;
            println!("{}", Value::Array(result));
        }
        DeviceAction::Listen { seconds } => {
            listen(control, seconds).await?;
        }
    }
    Ok(())
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let cache = DeviceCache::new(cli.cache.unwrap_or_else(default_cache_path));
    let discovery = Discovery::new(cache);

    match cli.command {
        Commands::Discover {
            output,
            timeout,
            no_cache,
        } => {
            let devices = discovery
                .discover(Duration::from_millis(timeout), !no_cache)
                .await;
            if devices.is_empty() {
                eprintln!("No devices found. If devices are missing, try increasing the search timeout.");
            }
            print_devices(&devices, output)?;
        }
        Commands::List { output } => {
            print_devices(&discovery.cache().load(), output)?;
        }
        Commands::AddDevice { ip, port, name } => {
            let mut device = DeviceRecord::new(ip, port);
            device.name = name;
            discovery.add_device_manually(device)?;
            println!("Added {} to {}", ip, discovery.cache().path().display());
        }
        Commands::RemoveDevice { ip } => {
            if discovery.remove_device(ip)? {
                println!("Removed {}", ip);
            } else {
                println!("{} was not cached", ip);
            }
        }
        Commands::DeviceCall {
            ip,
            port,
            timeout,
            smooth,
            action,
        } => {
            let options = ConnectionOptions {
                port: Some(port),
                timeout: Duration::from_millis(timeout),
            };
            let effect = smooth.map_or(Effect::Sudden, |millis| {
                Effect::Smooth(Duration::from_millis(millis))
            });
            let control = ControlInterface::new(&ip, options);
            control
                .connect()
                .await
                .with_context(|| format!("Failed to connect to {}:{}", ip, port))?;
            let result = handle_device_action(&control, action, effect).await;
            control.disconnect();
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_device_call() {
        let cli = Cli::parse_from([
            "yeelight_control",
            "device-call",
            "--ip",
            "192.168.1.20",
            "--smooth",
            "500",
            "set-brightness",
            "40",
        ]);
        match cli.command {
            Commands::DeviceCall {
                ip,
                port,
                smooth,
                action: DeviceAction::SetBrightness { brightness },
                ..
            } => {
                assert_eq!(ip, "192.168.1.20");
                assert_eq!(port, DEFAULT_PORT);
                assert_eq!(smooth, Some(500));
                assert_eq!(brightness, 40);
            }
            _ => panic!("unexpected command"),
        }
    }
}
