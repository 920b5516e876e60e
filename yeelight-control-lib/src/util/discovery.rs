use std::cmp::max;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::control_interface::{PowerState, DEFAULT_PORT};
use crate::util::cache::DeviceCache;

/// SSDP-style multicast group devices listen on.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const DISCOVERY_PORT: u16 = 1982;

const SEARCH_MESSAGE: &[u8] = b"M-SEARCH * HTTP/1.1\r\n\
HOST: 239.255.255.250:1982\r\n\
MAN: \"ssdp:discover\"\r\n\
ST: wifi_bulb\r\n";
const DEVICE_MARKER: &str = "yeelight";
const RECEIVE_BUFFER_SIZE: usize = 2048;

/// A known device, keyed by its IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerState>,
}

impl DeviceRecord {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        DeviceRecord {
            ip,
            port,
            id: None,
            model: None,
            name: None,
            firmware: None,
            capabilities: None,
            power: None,
        }
    }

    /// Whether the device advertised support for `method`.
    pub fn supports(&self, method: &str) -> bool {
        self.capabilities
            .as_ref()
            .is_some_and(|capabilities| capabilities.contains(method))
    }
}

/// Aborts the per-interface workers when dropped, so their sockets are closed on every
/// exit path of a scan.
struct Workers(Vec<JoinHandle<()>>);

impl Workers {
    async fn shutdown(mut self) {
        let handles = std::mem::take(&mut self.0);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            // Cancellation is the expected outcome here.
            let _ = handle.await;
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Finds devices on the local network and maintains the device cache.
pub struct Discovery {
    cache: DeviceCache,
}

impl Discovery {
    pub fn new(cache: DeviceCache) -> Self {
        Discovery { cache }
    }

    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    /// Splits an HTTP-like message into lowercase header names and their values.
    /// The first occurrence of a header wins; empty values are treated as absent.
    pub fn parse_headers(text: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            headers
                .entry(key.trim().to_lowercase())
                .or_insert_with(|| value.to_string());
        }
        headers
    }

    /// Parses `yeelight://192.168.1.10:55443` (scheme optional, port defaults to the
    /// control port).
    fn parse_location(location: &str) -> Option<(Ipv4Addr, u16)> {
        let authority = location
            .split_once("://")
            .map_or(location, |(_, rest)| rest);
        let authority = authority.split('/').next()?;
        match authority.rsplit_once(':') {
            Some((ip, port)) => Some((ip.parse().ok()?, port.parse().ok()?)),
            None => Some((authority.parse().ok()?, DEFAULT_PORT)),
        }
    }

    /// Decodes a search response or advertisement. `None` for datagrams from other
    /// device families and for responses without a usable location.
    pub fn decode_discovery_response(data: &[u8]) -> Option<DeviceRecord> {
        let text = String::from_utf8_lossy(data);
        if !text.to_lowercase().contains(DEVICE_MARKER) {
            return None;
        }

        let mut headers = Self::parse_headers(&text);
        let (ip, port) = Self::parse_location(headers.get("location")?)?;

        let mut record = DeviceRecord::new(ip, port);
        record.id = headers.remove("id");
        record.model = headers.remove("model");
        record.name = headers.remove("name");
        record.firmware = headers.remove("fw_ver");
        record.capabilities = headers
            .remove("support")
            .map(|support| support.split_whitespace().map(str::to_string).collect());
        record.power = headers.get("power").and_then(|power| power.parse().ok());
        Some(record)
    }

    /// Non-loopback IPv4 addresses of the local interfaces.
    fn local_interfaces() -> Vec<Ipv4Addr> {
        let mut addresses: Vec<Ipv4Addr> = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces
                .into_iter()
                .filter(|interface| !interface.is_loopback())
                .filter_map(|interface| match interface.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!("Failed to enumerate network interfaces: {}", e);
                Vec::new()
            }
        };
        addresses.sort();
        addresses.dedup();
        addresses
    }

    async fn probe_interface(
        interface: Ipv4Addr,
        target: SocketAddrV4,
        found: mpsc::UnboundedSender<DeviceRecord>,
    ) -> anyhow::Result<()> {
        let socket = UdpSocket::bind((interface, 0))
            .await
            .with_context(|| format!("Failed to bind discovery socket on {}", interface))?;
        // Search responses come back unicast to this ephemeral port, so a failed join
        // is not fatal.
        if let Err(e) = socket.join_multicast_v4(MULTICAST_GROUP, interface) {
            debug!("Could not join {} on {}: {}", MULTICAST_GROUP, interface, e);
        }
        if !interface.is_unspecified() {
            if let Err(e) = SockRef::from(&socket).set_multicast_if_v4(&interface) {
                debug!("Could not route multicast through {}: {}", interface, e);
            }
        }
        socket
            .send_to(SEARCH_MESSAGE, target)
            .await
            .with_context(|| format!("Failed to send search request from {}", interface))?;

        let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];
        loop {
            let (length, source) = socket
                .recv_from(&mut buffer)
                .await
                .context("Failed to receive response")?;
            match Self::decode_discovery_response(&buffer[..length]) {
                Some(record) => {
                    if found.send(record).is_err() {
                        return Ok(());
                    }
                }
                None => debug!("Ignoring datagram from {}", source),
            }
        }
    }

    /// Probes from every interface and collects responses until `given_timeout` has
    /// elapsed. Entries in `devices` are overwritten by live responses; within the scan
    /// the first response per ip wins.
    async fn scan(
        interfaces: &[Ipv4Addr],
        target: SocketAddrV4,
        given_timeout: Duration,
        mut devices: HashMap<Ipv4Addr, DeviceRecord>,
    ) -> HashMap<Ipv4Addr, DeviceRecord> {
        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let workers = Workers(
            interfaces
                .iter()
                .map(|&interface| {
                    let found_tx = found_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::probe_interface(interface, target, found_tx).await {
                            warn!("Discovery on interface {} failed: {:#}", interface, e);
                        }
                    })
                })
                .collect(),
        );
        drop(found_tx);

        let deadline = sleep(given_timeout);
        tokio::pin!(deadline);
        let mut responded = HashSet::new();
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(record) = found_rx.recv() => {
                    if responded.insert(record.ip) {
                        info!("Found device: {} ({})", record.ip, record.model.as_deref().unwrap_or("unknown model"));
                        devices.insert(record.ip, record);
                    } else {
                        debug!("Found device {} again, skipping", record.ip);
                    }
                }
            }
        }
        workers.shutdown().await;
        devices
    }

    /// Scans the local network for `given_timeout`. The scan always runs for the full
    /// duration.
    ///
    /// With `use_cache`, cached devices that did not answer are included and the merged
    /// result is written back to the cache.
    pub async fn discover(&self, given_timeout: Duration, use_cache: bool) -> Vec<DeviceRecord> {
        let seed: HashMap<Ipv4Addr, DeviceRecord> = if use_cache {
            self.cache
                .load()
                .into_iter()
                .map(|device| (device.ip, device))
                .collect()
        } else {
            HashMap::new()
        };

        let mut interfaces = Self::local_interfaces();
        if interfaces.is_empty() {
            interfaces.push(Ipv4Addr::UNSPECIFIED);
        }
        info!("Searching for devices on {} interface(s)", interfaces.len());

        let target = SocketAddrV4::new(MULTICAST_GROUP, DISCOVERY_PORT);
        let mut devices: Vec<DeviceRecord> = Self::scan(&interfaces, target, given_timeout, seed)
            .await
            .into_values()
            .collect();
        devices.sort_by_key(|device| device.ip);

        if use_cache {
            if let Err(e) = self.cache.save(&devices) {
                warn!("Failed to update device cache: {:#}", e);
            }
        }
        devices
    }

    pub fn add_device_manually(&self, device: DeviceRecord) -> anyhow::Result<()> {
        self.cache.upsert(device)
    }

    /// Returns whether the device was cached.
    pub fn remove_device(&self, ip: Ipv4Addr) -> anyhow::Result<bool> {
        self.cache.remove(ip)
    }

    pub fn pretty_print_devices(devices: &[DeviceRecord]) {
        const HEADERS: [&str; 6] = ["IP Address", "Port", "Device ID", "Model", "Name", "Power"];

        let rows: Vec<[String; 6]> = devices
            .iter()
            .map(|d| {
                [
                    d.ip.to_string(),
                    d.port.to_string(),
                    d.id.clone().unwrap_or_default(),
                    d.model.clone().unwrap_or_default(),
                    d.name.clone().unwrap_or_default(),
                    d.power.map(|p| p.to_string()).unwrap_or_default(),
                ]
            })
            .collect();

        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = max(*width, cell.len());
            }
        }

        let format_row = |cells: [&str; 6]| {
            cells
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = width + 2))
                .collect::<String>()
                .trim_end()
                .to_string()
        };

        println!("{}", format_row(HEADERS));
        println!("{}", format_row(widths.map(|w| "-".repeat(w)).each_ref().map(String::as_str)));
        for row in &rows {
            println!("{}", format_row(row.each_ref().map(String::as_str)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "HTTP/1.1 200 OK\r\n\
Cache-Control: max-age=3600\r\n\
Date: \r\n\
Ext: \r\n\
Location: yeelight://192.168.1.239:55443\r\n\
Server: POSIX UPnP/1.0 YGLC/1\r\n\
id: 0x000000000015243f\r\n\
model: color\r\n\
fw_ver: 18\r\n\
support: get_prop set_default set_power toggle set_bright set_rgb\r\n\
power: on\r\n\
bright: 100\r\n\
name: desk\r\n";

    fn response_for(ip: &str, name: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nLocation: yeelight://{}:55443\r\nmodel: mono\r\nname: {}\r\n",
            ip, name
        )
    }

    #[test]
    fn test_decode_discovery_response() {
        let record = Discovery::decode_discovery_response(RESPONSE.as_bytes()).unwrap();
        assert_eq!(record.ip, Ipv4Addr::new(192, 168, 1, 239));
        assert_eq!(record.port, 55443);
        assert_eq!(record.id.as_deref(), Some("0x000000000015243f"));
        assert_eq!(record.model.as_deref(), Some("color"));
        assert_eq!(record.firmware.as_deref(), Some("18"));
        assert_eq!(record.name.as_deref(), Some("desk"));
        assert_eq!(record.power, Some(PowerState::On));
        assert!(record.supports("set_rgb"));
        assert!(!record.supports("start_cf"));
    }

    #[test]
    fn test_missing_headers_are_absent() {
        let data = b"HTTP/1.1 200 OK\r\nLOCATION: yeelight://10.0.0.5\r\n";
        let record = Discovery::decode_discovery_response(data).unwrap();
        assert_eq!(record, DeviceRecord::new(Ipv4Addr::new(10, 0, 0, 5), DEFAULT_PORT));
    }

    #[test]
    fn test_foreign_or_incomplete_responses_are_rejected() {
        let foreign = b"HTTP/1.1 200 OK\r\nLocation: http://192.168.1.2:80/desc.xml\r\nST: upnp:rootdevice\r\n";
        assert!(Discovery::decode_discovery_response(foreign).is_none());
        let no_location = b"HTTP/1.1 200 OK\r\nServer: yeelight\r\n";
        assert!(Discovery::decode_discovery_response(no_location).is_none());
        let bad_location = b"HTTP/1.1 200 OK\r\nLocation: yeelight://bulb.local:55443\r\n";
        assert!(Discovery::decode_discovery_response(bad_location).is_none());
    }

    #[test]
    fn test_parse_headers_keeps_first_value() {
        let headers = Discovery::parse_headers("A: 1\r\nb: x:y\r\na: 2\r\nempty:\r\n");
        assert_eq!(headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(headers.get("b").map(String::as_str), Some("x:y"));
        assert!(!headers.contains_key("empty"));
    }

    /// Answers every probe it receives with the response produced for that probe's index.
    async fn spawn_responder(responses: Vec<String>) -> (SocketAddrV4, JoinHandle<usize>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = match socket.local_addr().unwrap() {
            std::net::SocketAddr::V4(address) => address,
            other => panic!("unexpected address {}", other),
        };
        let handle = tokio::spawn(async move {
            let mut buffer = [0u8; 512];
            for response in &responses {
                let (length, source) = socket.recv_from(&mut buffer).await.unwrap();
                assert!(buffer[..length].starts_with(b"M-SEARCH"));
                socket.send_to(response.as_bytes(), source).await.unwrap();
            }
            responses.len()
        });
        (address, handle)
    }

    #[tokio::test]
    async fn test_scan_dedupes_responses_across_sockets() {
        let (target, responder) = spawn_responder(vec![
            response_for("192.168.1.50", "first"),
            response_for("192.168.1.50", "second"),
        ])
        .await;
        let localhost = Ipv4Addr::LOCALHOST;

        let devices = Discovery::scan(
            &[localhost, localhost],
            target,
            Duration::from_millis(300),
            HashMap::new(),
        )
        .await;

        assert_eq!(responder.await.unwrap(), 2);
        assert_eq!(devices.len(), 1);
        let device = &devices[&Ipv4Addr::new(192, 168, 1, 50)];
        assert!(matches!(device.name.as_deref(), Some("first") | Some("second")));
    }

    #[tokio::test]
    async fn test_scan_prefers_live_responses_over_seed() {
        let (target, responder) =
            spawn_responder(vec![response_for("192.168.1.50", "live")]).await;
        let mut cached = DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 50), DEFAULT_PORT);
        cached.name = Some("cached".to_string());
        let offline = DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 60), DEFAULT_PORT);
        let seed = HashMap::from([(cached.ip, cached), (offline.ip, offline.clone())]);

        let devices = Discovery::scan(
            &[Ipv4Addr::LOCALHOST],
            target,
            Duration::from_millis(300),
            seed,
        )
        .await;

        responder.await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[&Ipv4Addr::new(192, 168, 1, 50)].name.as_deref(),
            Some("live")
        );
        assert_eq!(devices[&offline.ip], offline);
    }

    #[tokio::test]
    async fn test_failing_interface_does_not_abort_scan() {
        let (target, responder) =
            spawn_responder(vec![response_for("192.168.1.70", "ok")]).await;
        // TEST-NET-1 is never assigned locally, so binding to it fails.
        let unusable = Ipv4Addr::new(192, 0, 2, 1);

        let devices = Discovery::scan(
            &[unusable, Ipv4Addr::LOCALHOST],
            target,
            Duration::from_millis(300),
            HashMap::new(),
        )
        .await;

        responder.await.unwrap();
        assert!(devices.contains_key(&Ipv4Addr::new(192, 168, 1, 70)));
    }

    #[tokio::test]
    async fn test_scan_waits_for_full_timeout() {
        let (target, _responder) =
            spawn_responder(vec![response_for("192.168.1.80", "quick")]).await;
        let started = tokio::time::Instant::now();
        Discovery::scan(
            &[Ipv4Addr::LOCALHOST],
            target,
            Duration::from_millis(200),
            HashMap::new(),
        )
        .await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_manual_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = Discovery::new(DeviceCache::new(dir.path().join("devices.json")));
        let record = DeviceRecord::new(Ipv4Addr::new(192, 168, 1, 90), DEFAULT_PORT);

        discovery.add_device_manually(record.clone()).unwrap();
        assert_eq!(discovery.cache().load(), vec![record.clone()]);
        assert!(discovery.remove_device(record.ip).unwrap());
        assert!(!discovery.remove_device(record.ip).unwrap());
        assert!(discovery.cache().load().is_empty());
    }
}
