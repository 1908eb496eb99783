#![no_std]
#![no_main]

use embassy_net::{Config, Runner, Stack, StackResources};
use embassy_time::{Duration, Instant, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Flex, Io};
use esp_hal::rng::Rng;
use esp_hal::timer::timg::TimerGroup;
use esp_hal_embassy::Executor;
use esp_wifi::wifi::{self, WifiDevice};
use esp_wifi::EspWifiController;
use log::{error, info, warn};
use static_cell::StaticCell;

use wlab_station::config::{self, ConfigString, MemoryStore, Settings};
use wlab_station::dht::Dht22;
use wlab_station::hw::{self, DhtLine, HardwareWatchdog, SntpClient, TcpTransport, DHT_CAPTURE};
use wlab_station::mqtt::{self, LogHandler, TelemetryClient, TelemetryWorker, WorkerConfig, WorkerShared, WorkerTimeouts};
use wlab_station::station::{Station, AUTHORIZE_ATTEMPTS, FIRST_CONNECT_WINDOW_SECS};
use wlab_station::timestamp::{Timestamp, RESYNC_PERIOD_SECS, SYNC_ATTEMPTS};
use wlab_station::watchdog::{self, Watchdog, FEED_PERIOD_MS};
use wlab_station::wifi::WiFiManager;

esp_bootloader_esp_idf::esp_app_desc!();

const SOCKET_BUFFER_SIZE: usize = 1536;
/// Gap between resync attempts once the clock is due
const RESYNC_RETRY_MS: u64 = 60_000;

// Static allocations
static WIFI_INIT_CELL: StaticCell<EspWifiController<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();
static WIFI_MANAGER: StaticCell<WiFiManager<'static>> = StaticCell::new();
static SETTINGS: StaticCell<Settings> = StaticCell::new();
static STATION_UID: StaticCell<ConfigString> = StaticCell::new();
static SOCKET_RX: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();
static SOCKET_TX: StaticCell<[u8; SOCKET_BUFFER_SIZE]> = StaticCell::new();
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

static WORKER_SHARED: WorkerShared = WorkerShared::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    error!("[MAIN] Panic: {}", info);
    esp_hal::system::software_reset()
}

fn fatal(what: &str) -> ! {
    error!("[MAIN] {}, resetting", what);
    esp_hal::system::software_reset()
}

fn uptime_ms() -> u64 {
    Instant::now().as_millis()
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 72 * 1024);

    info!("[MAIN] wlab-station {}", wlab_station::VERSION);

    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);
    let watchdog = HardwareWatchdog::new(timer_group0.wdt);

    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());

    let Ok(wifi_init) = esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) else {
        fatal("WiFi driver init failed")
    };
    let wifi_init = WIFI_INIT_CELL.init(wifi_init);
    let Ok((controller, interfaces)) = wifi::new(wifi_init, peripherals.WIFI) else {
        fatal("WiFi interface init failed")
    };
    let wifi_device = interfaces.sta;
    let mac = wifi_device.mac_address();

    // No persistent store on this board; every key resolves to its build-time default.
    let mut store = MemoryStore::new();
    match config::record_boot(&mut store) {
        Ok(count) => info!("[MAIN] Boot #{}", count),
        Err(e) => warn!("[MAIN] Boot count not recorded: {}", e),
    }
    let settings: &'static Settings = SETTINGS.init(Settings::load(&store));
    let uid: &'static ConfigString = STATION_UID.init(settings.station_uid(mac));
    info!("[MAIN] Station {} ({})", settings.station_name, uid);

    let resources = STACK_RESOURCES.init(StackResources::new());
    let (stack, runner) = embassy_net::new(wifi_device, Config::dhcpv4(Default::default()), resources, seed);

    let mut wifi_manager = WiFiManager::new(controller, stack);
    wifi_manager.on_disconnect(|| WORKER_SHARED.notify_disconnect());
    let wifi_manager = WIFI_MANAGER.init(wifi_manager);

    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(hw::gpio_handler);
    let line = DhtLine::new(Flex::new(peripherals.GPIO5));

    let transport = TcpTransport::new(
        stack,
        SOCKET_RX.init([0; SOCKET_BUFFER_SIZE]),
        SOCKET_TX.init([0; SOCKET_BUFFER_SIZE]),
    );
    let worker_config = WorkerConfig::new(settings.broker_host.as_str(), settings.broker_port)
        .with_ping_interval(settings.ping_interval());
    let worker = TelemetryWorker::new(transport, worker_config, &WORKER_SHARED);

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        info!("[MAIN] Spawning network task");
        spawner.spawn(net_task(runner)).ok();

        info!("[MAIN] Spawning WiFi link task");
        spawner.spawn(link_task(wifi_manager, settings)).ok();

        info!("[MAIN] Spawning telemetry worker");
        spawner.spawn(telemetry_task(worker)).ok();
        spawner.spawn(dispatch_task()).ok();

        info!("[MAIN] Spawning station task");
        spawner.spawn(station_task(settings, uid.as_str(), stack, line, watchdog)).ok();
    })
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, WifiDevice<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn link_task(wifi: &'static mut WiFiManager<'static>, settings: &'static Settings) -> ! {
    loop {
        if !wifi.is_connected() {
            if let Err(e) = wifi
                .connect(settings.wifi_ssid.as_str(), settings.wifi_password.as_str())
                .await
            {
                warn!("[WIFI] Connect failed: {}", e);
                Timer::after(Duration::from_secs(4)).await;
                continue;
            }
        }

        wifi.monitor_connection();
        Timer::after(Duration::from_secs(1)).await;
    }
}

#[embassy_executor::task]
async fn telemetry_task(mut worker: TelemetryWorker<'static, TcpTransport<'static>>) -> ! {
    worker.run().await
}

#[embassy_executor::task]
async fn dispatch_task() -> ! {
    let mut handler = LogHandler;
    mqtt::dispatch(&WORKER_SHARED, &mut handler).await
}

#[embassy_executor::task]
async fn station_task(
    settings: &'static Settings,
    uid: &'static str,
    stack: Stack<'static>,
    line: DhtLine,
    mut watchdog: HardwareWatchdog,
) -> ! {
    let Ok(sensor) = Dht22::new(line, &DHT_CAPTURE) else {
        error!("[DHT] Data line stuck");
        watchdog.hard_reset()
    };
    let client = TelemetryClient::new(&WORKER_SHARED, WorkerTimeouts::default().publish_ack);

    let mut connected = false;
    for _ in 0..FIRST_CONNECT_WINDOW_SECS {
        watchdog.feed();
        if client.wait_connected(Duration::from_secs(1)).await {
            connected = true;
            break;
        }
    }
    if !connected {
        error!("[WLAB] No broker session within {} s", FIRST_CONNECT_WINDOW_SECS);
        watchdog.hard_reset();
    }

    let mut clock = Timestamp::new();
    let mut sntp = SntpClient::new(stack, hw::SNTP_SERVER);
    for attempt in 1..=SYNC_ATTEMPTS {
        watchdog.feed();
        if clock.sync(&mut sntp, uptime_ms()).await {
            break;
        }
        warn!("[TIME] Attempt {}/{} failed", attempt, SYNC_ATTEMPTS);
        Timer::after(Duration::from_secs(1)).await;
    }
    if !clock.is_synced() {
        error!("[TIME] Clock never synchronized");
        watchdog.hard_reset();
    }

    let mut station = Station::new(sensor, client, settings, uid);
    let mut registered = false;
    for attempt in 1..=AUTHORIZE_ATTEMPTS {
        watchdog.feed();
        match station.authorize().await {
            Ok(()) => {
                registered = true;
                break;
            }
            Err(e) => {
                warn!("[WLAB] Registration {}/{} failed: {}", attempt, AUTHORIZE_ATTEMPTS, e);
                Timer::after(Duration::from_secs(1)).await;
            }
        }
    }
    if !registered {
        error!("[WLAB] Registration rejected");
        watchdog.hard_reset();
    }

    let max_silence = settings.max_silence();
    let mut last_resync_attempt = 0u64;
    loop {
        let uptime = uptime_ms();
        if clock.needs_resync(uptime, RESYNC_PERIOD_SECS)
            && uptime.saturating_sub(last_resync_attempt) >= RESYNC_RETRY_MS
        {
            last_resync_attempt = uptime;
            watchdog.feed();
            clock.sync(&mut sntp, uptime).await;
        }

        station.tick(clock.now(uptime_ms())).await;
        watchdog::supervise(&mut watchdog, WORKER_SHARED.liveness(Instant::now(), max_silence));

        Timer::after(Duration::from_millis(FEED_PERIOD_MS)).await;
    }
}
