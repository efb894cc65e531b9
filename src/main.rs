#![no_std]
#![no_main]

use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::rmt::{Rmt, TxChannelConfig, TxChannelCreator};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_println::println;

extern crate alloc;

// WiFi imports
use esp_wifi::wifi;

// Embassy-net imports
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{Config, Stack, StackResources};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker};
use esp_hal_embassy::Executor;
use static_cell::StaticCell;

// Import our library modules
use ambient_board::config::{self, BoardConfig};
use ambient_board::controller::BoardController;
use ambient_board::led_control::Renderer;
use ambient_board::platform::{FrameChannel, NetSocket, RmtLink, drive_rmt};
use ambient_board::state_machine::{StateMachine, SystemEvent};
use ambient_board::udp_server::ProtocolServer;
use ambient_board::wifi::WiFiManager;

// Add app descriptor for espflash compatibility
esp_bootloader_esp_idf::esp_app_desc!();

// Use the concrete channel type
type RmtChannel = esp_hal::rmt::Channel<esp_hal::Blocking, 0>;
type LedRenderer = Renderer<RmtLink>;
type Board = BoardController<'static, RmtLink>;

// Frames queued by the renderer for the RMT task
static FRAMES: FrameChannel = Channel::new();

// Static cells for embassy components
static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
static WIFI_MANAGER_CELL: StaticCell<WiFiManager<'static>> = StaticCell::new();
static RENDERER_CELL: StaticCell<LedRenderer> = StaticCell::new();
static SERVER_CELL: StaticCell<ProtocolServer> = StaticCell::new();
static BOARD_CELL: StaticCell<Board> = StaticCell::new();
static STATE_MACHINE_CELL: StaticCell<StateMachine> = StaticCell::new();

// Static executor for embassy tasks
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[MAIN] Panic: {}", info);
    loop {}
}

// Embassy task to run the network stack
#[embassy_executor::task]
async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn wifi_task(
    manager: &'static mut WiFiManager<'static>,
    machine: &'static StateMachine,
    board: &'static Board,
) -> ! {
    manager.run(machine, board).await
}

#[embassy_executor::task]
async fn state_machine_task(machine: &'static StateMachine, board: &'static Board) -> ! {
    machine.run(board).await
}

/// UDP server background task
#[embassy_executor::task]
async fn udp_server_task(
    stack: Stack<'static>,
    server: &'static ProtocolServer,
    board: &'static Board,
    machine: &'static StateMachine,
) -> ! {
    // Create UDP socket buffers
    let mut rx_buffer = [0; config::MAX_PACKET_SIZE];
    let mut tx_buffer = [0; 512];
    let mut rx_meta = [PacketMetadata::EMPTY; 16];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );

    server.serve(&mut NetSocket::new(socket), board, machine).await
}

#[embassy_executor::task]
async fn rmt_task(channel: RmtChannel, renderer: &'static LedRenderer) -> ! {
    drive_rmt(channel, &FRAMES, renderer).await
}

/// Breathing animation at 30fps
#[embassy_executor::task]
async fn animation_task(renderer: &'static LedRenderer) -> ! {
    renderer.run_animation().await
}

#[embassy_executor::task]
async fn idle_watch_task(board: &'static Board) -> ! {
    board.run_idle_watch().await
}

#[embassy_executor::task]
async fn status_report_task(
    machine: &'static StateMachine,
    server: &'static ProtocolServer,
    renderer: &'static LedRenderer,
) -> ! {
    let mut ticker = Ticker::every(Duration::from_secs(config::STATUS_REPORT_INTERVAL_SECS));
    loop {
        ticker.next().await;

        let udp = server.stats();
        let led = renderer.stats();
        println!(
            "[MAIN] State: {} (errors: {}) | UDP: {} packets, {} bytes, {} pixel, {} probe, {} ignored, {} invalid | LED: {} frames, {} bytes, {} busy, mode {:?}",
            machine.get_current_state(),
            machine.error_count(),
            udp.packets,
            udp.bytes,
            udp.pixel_packets,
            udp.probe_packets,
            udp.ignored_packets,
            udp.invalid_packets,
            led.transmissions,
            led.bytes_transmitted,
            led.busy_skips,
            renderer.mode(),
        );
    }
}

#[esp_hal::main]
fn main() -> ! {
    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);

    // Heap for WiFi, the pixel buffer and encoded frames
    esp_alloc::heap_allocator!(size: 96 * 1024);

    esp_println::logger::init_logger_from_env();
    println!("[MAIN] Ambient light board v{}", ambient_board::VERSION);

    // Initialize embassy time system
    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    let board_config = match BoardConfig::from_build_env() {
        Ok(board_config) => board_config,
        Err(e) => {
            println!("[MAIN] Invalid LED settings ({}), using defaults", e);
            BoardConfig::default()
        }
    };
    println!(
        "[MAIN] {} LEDs, {} channels, UDP port {}",
        board_config.led_count,
        board_config.order.channels(),
        board_config.udp_port
    );

    // Drive the data line low before the RMT takes it over
    let led_pin = Output::new(peripherals.GPIO4, Level::Low, OutputConfig::default())
        .into_peripheral_output();

    // Initialize RMT peripheral with 10MHz frequency for WS2812 timing
    let rmt = match Rmt::new(peripherals.RMT, Rate::from_mhz(10)) {
        Ok(rmt) => rmt,
        Err(e) => panic!("RMT initialization failed: {:?}", e),
    };
    let tx_config = TxChannelConfig::default()
        .with_clk_divider(1)
        .with_idle_output_level(Level::Low)
        .with_idle_output(false)
        .with_carrier_modulation(false);
    let rmt_channel = match rmt.channel0.configure(led_pin, tx_config) {
        Ok(channel) => channel,
        Err(e) => panic!("RMT channel configuration failed: {:?}", e),
    };

    let renderer: &'static LedRenderer = match Renderer::initialize(
        RmtLink::new(&FRAMES),
        board_config.data_pin,
        board_config.led_count,
        board_config.order.clone(),
        board_config.breathing,
    ) {
        Ok(renderer) => RENDERER_CELL.init(renderer),
        Err(e) => panic!("LED renderer initialization failed: {}", e),
    };
    println!("[LED] Renderer initialized");

    let server: &'static ProtocolServer = SERVER_CELL.init(ProtocolServer::new(
        board_config.udp_port,
        board_config.max_buffer_bytes(),
    ));
    let board: &'static Board = BOARD_CELL.init(BoardController::new(
        renderer,
        server,
        board_config.base_color,
    ));
    let machine: &'static StateMachine = STATE_MACHINE_CELL.init(StateMachine::new());

    // Initialize WiFi driver
    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let rng = Rng::new(peripherals.RNG);
    let wifi_init = match esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK) {
        Ok(wifi_init) => WIFI_INIT_CELL.init(wifi_init),
        Err(e) => panic!("WiFi driver initialization failed: {:?}", e),
    };
    let (wifi_controller, wifi_interfaces) = match wifi::new(wifi_init, peripherals.WIFI) {
        Ok(wifi) => wifi,
        Err(e) => panic!("WiFi controller creation failed: {:?}", e),
    };
    println!("[WIFI] WiFi driver initialized successfully");

    // Create embassy-net stack with DHCP configuration
    let (stack, runner) = embassy_net::new(
        wifi_interfaces.sta,
        Config::dhcpv4(Default::default()),
        STACK_RESOURCES.init(StackResources::new()),
        1234,
    );
    let wifi_manager = WIFI_MANAGER_CELL.init(WiFiManager::new(wifi_controller, stack));

    if let Err(e) = board.start() {
        println!("[LED] Could not start breathing: {}", e);
    }
    if let Err(e) = machine.try_handle_event(SystemEvent::InitComplete) {
        println!("[STATE] Could not queue startup event: {}", e);
    }

    // Initialize embassy executor and run tasks
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        println!("[MAIN] Spawning tasks...");
        spawner.spawn(net_task(runner)).ok();
        spawner.spawn(rmt_task(rmt_channel, renderer)).ok();
        spawner.spawn(animation_task(renderer)).ok();
        spawner.spawn(state_machine_task(machine, board)).ok();
        spawner.spawn(wifi_task(wifi_manager, machine, board)).ok();
        spawner
            .spawn(udp_server_task(stack, server, board, machine))
            .ok();
        spawner.spawn(idle_watch_task(board)).ok();
        spawner
            .spawn(status_report_task(machine, server, renderer))
            .ok();
    });
}
