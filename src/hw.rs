//! ESP32-C3 bindings: DHT22 data line, broker socket, SNTP client and watchdog

use core::cell::RefCell;
use core::convert::Infallible;
use core::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use critical_section::Mutex;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_time::{with_timeout, Duration};
use embedded_hal::digital::{ErrorType, OutputPin};
use esp_hal::gpio::{DriveMode, Event, Flex, InputConfig, OutputConfig, Pull};
use esp_hal::handler;
use esp_hal::peripherals::TIMG0;
use esp_hal::timer::timg::{MwdtStage, Wdt};
use log::{debug, warn};
use sntpc::{NtpContext, NtpTimestampGenerator, NtpUdpSocket};

use crate::dht::{EdgeCapture, SensorLine};
use crate::mqtt::Transport;
use crate::timestamp::{TimeSource, SNTP_PORT};
use crate::watchdog::{Watchdog, WATCHDOG_TIMEOUT_SECS};

pub const SNTP_SERVER: &str = "pool.ntp.org";
const SNTP_TIMEOUT: Duration = Duration::from_secs(2);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Edge capture fed by [`gpio_handler`]
pub static DHT_CAPTURE: EdgeCapture = EdgeCapture::new();

static DHT_PIN: Mutex<RefCell<Option<Flex<'static>>>> = Mutex::new(RefCell::new(None));

fn now_us() -> u32 {
    // Wraps every ~71 minutes; the decoder works on wrapping differences
    esp_hal::time::Instant::now()
        .duration_since_epoch()
        .as_micros() as u32
}

/// GPIO interrupt: timestamp falling edges of the DHT22 line
#[handler]
pub fn gpio_handler() {
    let now = now_us();
    let fired = critical_section::with(|cs| match DHT_PIN.borrow_ref_mut(cs).as_mut() {
        Some(pin) if pin.is_interrupt_set() => {
            pin.clear_interrupt();
            true
        }
        _ => false,
    });

    if fired {
        DHT_CAPTURE.on_falling_edge(now);
    }
}

/// Open-drain DHT22 data line; the pin itself lives in a static shared with the ISR
pub struct DhtLine;

impl DhtLine {
    pub fn new(mut pin: Flex<'static>) -> Self {
        pin.apply_output_config(
            &OutputConfig::default()
                .with_drive_mode(DriveMode::OpenDrain)
                .with_pull(Pull::Up),
        );
        pin.apply_input_config(&InputConfig::default().with_pull(Pull::Up));
        pin.set_input_enable(true);
        pin.set_output_enable(true);
        pin.set_high();

        critical_section::with(|cs| DHT_PIN.borrow_ref_mut(cs).replace(pin));
        Self
    }

    fn with_pin(f: impl FnOnce(&mut Flex<'static>)) {
        critical_section::with(|cs| {
            if let Some(pin) = DHT_PIN.borrow_ref_mut(cs).as_mut() {
                f(pin);
            }
        });
    }
}

impl ErrorType for DhtLine {
    type Error = Infallible;
}

impl OutputPin for DhtLine {
    fn set_low(&mut self) -> Result<(), Infallible> {
        Self::with_pin(|pin| pin.set_low());
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        Self::with_pin(|pin| pin.set_high());
        Ok(())
    }
}

impl SensorLine for DhtLine {
    fn now_us(&self) -> u32 {
        now_us()
    }

    fn listen(&mut self) {
        Self::with_pin(|pin| {
            pin.clear_interrupt();
            pin.listen(Event::FallingEdge);
        });
    }

    fn unlisten(&mut self) {
        Self::with_pin(|pin| pin.unlisten());
    }
}

#[derive(Debug)]
pub enum NetError {
    Dns(embassy_net::dns::Error),
    NoAddress,
    Connect(embassy_net::tcp::ConnectError),
    Tcp(embassy_net::tcp::Error),
    Closed,
    Udp,
    Timeout,
    Sntp(sntpc::Error),
}

/// Broker connection over an embassy-net TCP socket
pub struct TcpTransport<'a> {
    stack: Stack<'a>,
    socket: TcpSocket<'a>,
}

impl<'a> TcpTransport<'a> {
    pub fn new(stack: Stack<'a>, rx_buffer: &'a mut [u8], tx_buffer: &'a mut [u8]) -> Self {
        let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        Self { stack, socket }
    }
}

async fn resolve_v4(stack: Stack<'_>, host: &str) -> Result<Ipv4Addr, NetError> {
    let addresses = stack
        .dns_query(host, DnsQueryType::A)
        .await
        .map_err(NetError::Dns)?;

    addresses
        .iter()
        .find_map(|address| match address {
            IpAddress::Ipv4(v4) => Some(*v4),
            #[allow(unreachable_patterns)]
            _ => None,
        })
        .ok_or(NetError::NoAddress)
}

impl Transport for TcpTransport<'_> {
    type Error = NetError;

    async fn resolve(&mut self, host: &str) -> Result<Ipv4Addr, NetError> {
        resolve_v4(self.stack, host).await
    }

    async fn connect(&mut self, remote: SocketAddrV4) -> Result<(), NetError> {
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(*remote.ip()), remote.port());
        self.socket.connect(endpoint).await.map_err(NetError::Connect)
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.socket.read(buf).await.map_err(NetError::Tcp)
    }

    async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), NetError> {
        while !buf.is_empty() {
            let written = self.socket.write(buf).await.map_err(NetError::Tcp)?;
            if written == 0 {
                return Err(NetError::Closed);
            }
            buf = &buf[written..];
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.socket.abort();
        let _ = with_timeout(Duration::from_secs(1), self.socket.flush()).await;
        debug!("[MQTT] Socket closed");
    }
}

/// Uptime clock used for the originate timestamp
#[derive(Debug, Clone, Copy, Default)]
struct UptimeClock {
    micros: u64,
}

impl NtpTimestampGenerator for UptimeClock {
    fn init(&mut self) {
        self.micros = embassy_time::Instant::now().as_micros();
    }

    fn timestamp_sec(&self) -> u64 {
        self.micros / 1_000_000
    }

    fn timestamp_subsec_micros(&self) -> u32 {
        (self.micros % 1_000_000) as u32
    }
}

struct SntpSocket<'s, 'a>(&'s UdpSocket<'a>);

impl NtpUdpSocket for SntpSocket<'_, '_> {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> sntpc::Result<usize> {
        let SocketAddr::V4(addr) = addr else {
            return Err(sntpc::Error::Network);
        };
        let endpoint = IpEndpoint::new(IpAddress::Ipv4(*addr.ip()), addr.port());
        self.0
            .send_to(buf, endpoint)
            .await
            .map_err(|_| sntpc::Error::Network)?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> sntpc::Result<(usize, SocketAddr)> {
        let (len, meta) = self
            .0
            .recv_from(buf)
            .await
            .map_err(|_| sntpc::Error::Network)?;
        let ip = match meta.endpoint.addr {
            IpAddress::Ipv4(v4) => IpAddr::V4(v4),
            #[allow(unreachable_patterns)]
            _ => return Err(sntpc::Error::Network),
        };
        Ok((len, SocketAddr::new(ip, meta.endpoint.port)))
    }
}

/// One-shot SNTP queries over UDP
pub struct SntpClient<'a> {
    stack: Stack<'a>,
    server: &'a str,
}

impl<'a> SntpClient<'a> {
    pub fn new(stack: Stack<'a>, server: &'a str) -> Self {
        Self { stack, server }
    }
}

impl TimeSource for SntpClient<'_> {
    type Error = NetError;

    async fn fetch_epoch(&mut self) -> Result<u64, NetError> {
        let server = resolve_v4(self.stack, self.server).await?;

        let mut rx_meta = [PacketMetadata::EMPTY; 2];
        let mut tx_meta = [PacketMetadata::EMPTY; 2];
        let mut rx_buffer = [0u8; 128];
        let mut tx_buffer = [0u8; 128];
        let mut socket = UdpSocket::new(
            self.stack,
            &mut rx_meta,
            &mut rx_buffer,
            &mut tx_meta,
            &mut tx_buffer,
        );
        socket.bind(0).map_err(|_| NetError::Udp)?;

        let remote = SocketAddr::new(IpAddr::V4(server), SNTP_PORT);
        let context = NtpContext::new(UptimeClock::default());
        let result = with_timeout(SNTP_TIMEOUT, sntpc::get_time(remote, &SntpSocket(&socket), context))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| {
                warn!("[TIME] Bad response from {}: {:?}", server, e);
                NetError::Sntp(e)
            })?;

        Ok(u64::from(result.sec()))
    }
}

/// Main watchdog of timer group 0
pub struct HardwareWatchdog {
    wdt: Wdt<TIMG0<'static>>,
}

impl HardwareWatchdog {
    pub fn new(mut wdt: Wdt<TIMG0<'static>>) -> Self {
        wdt.set_timeout(
            MwdtStage::Stage0,
            esp_hal::time::Duration::from_secs(WATCHDOG_TIMEOUT_SECS),
        );
        wdt.enable();
        Self { wdt }
    }
}

impl Watchdog for HardwareWatchdog {
    fn feed(&mut self) {
        self.wdt.feed();
    }

    fn hard_reset(&mut self) -> ! {
        esp_hal::system::software_reset()
    }
}
