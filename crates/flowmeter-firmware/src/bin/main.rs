#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex as CsMutex;
use embassy_executor::Spawner;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::{Duration, Ticker, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Event, Input, InputConfig, Io, Level, Output, OutputConfig, Pull};
use esp_hal::timer::timg::TimerGroup;
use esp_hal::{handler, ram};
use log::{error, info, warn};
use static_cell::StaticCell;

use flowmeter_core::announce::ANNOUNCE_INTERVAL_SECS;
use flowmeter_core::config::SyncConfig;
use flowmeter_core::{Indicator, PulseCounter, SyncCoordinator, TickOutcome};
use flowmeter_firmware::clock::RtcClock;
use flowmeter_firmware::hardware::{self, FirmwareBackend};

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

type Coordinator = SyncCoordinator<'static, FirmwareBackend, &'static RtcClock>;
type SharedCoordinator = Mutex<NoopRawMutex, RefCell<Coordinator>>;

/// Pulses counted by the sensor interrupt
static PULSES: PulseCounter = PulseCounter::new();
static CLOCK: RtcClock = RtcClock::new();
static COORDINATOR: StaticCell<SharedCoordinator> = StaticCell::new();

/// Pins touched by the interrupt handler
static SENSOR: CsMutex<RefCell<Option<Input<'static>>>> = CsMutex::new(RefCell::new(None));
static LED: CsMutex<RefCell<Option<Output<'static>>>> = CsMutex::new(RefCell::new(None));
/// Mirror of the persisted indicator, read by the interrupt
static BLINK: AtomicBool = AtomicBool::new(false);

#[handler]
#[ram]
fn on_pulse() {
    critical_section::with(|cs| {
        let mut sensor = SENSOR.borrow_ref_mut(cs);
        let Some(sensor) = sensor.as_mut() else {
            return;
        };
        if !sensor.is_interrupt_set() {
            return;
        }
        sensor.clear_interrupt();
        PULSES.record_pulse();

        if BLINK.load(Ordering::Relaxed)
            && let Some(led) = LED.borrow_ref_mut(cs).as_mut()
        {
            led.toggle();
        }
    });
}

/// Runs the coordinator once a second; it decides whether anything is written.
#[embassy_executor::task]
async fn flush_task(coordinator: &'static SharedCoordinator) {
    let mut ticker = Ticker::every(Duration::from_secs(1));
    loop {
        ticker.next().await;
        coordinator.lock(|sync| {
            let mut sync = sync.borrow_mut();
            match sync.tick() {
                TickOutcome::Saved => info!("Flushed usage={}", sync.persisted().usage),
                TickOutcome::Failed => warn!("Flush failed, retrying next tick"),
                TickOutcome::Clean | TickOutcome::Throttled => {}
            }
            BLINK.store(sync.persisted().indicator == Indicator::Blink, Ordering::Relaxed);
        });
    }
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    // Storage first, so the record is loaded before pulses are counted
    #[cfg(feature = "storage-fram")]
    let backend = match hardware::create_i2c_bus(
        peripherals.I2C0,
        peripherals.GPIO12,
        peripherals.GPIO13,
    ) {
        Ok(i2c) => hardware::fram_backend(i2c),
        Err(e) => {
            error!("I2C configuration rejected: {:?}", e);
            hardware::volatile_backend()
        }
    };

    #[cfg(feature = "storage-sd")]
    let backend = hardware::sd_backend(
        peripherals.SPI2,
        hardware::SdPins {
            sck: peripherals.GPIO36,
            mosi: peripherals.GPIO37,
            miso: peripherals.GPIO35,
            cs: peripherals.GPIO10,
        },
        &CLOCK,
    );

    let sync_config =
        SyncConfig::default().with_flush_interval_secs(env!("FLUSH_INTERVAL_SECS").parse().unwrap_or(600));
    let mut sync = SyncCoordinator::new(backend, &CLOCK, &PULSES, sync_config);
    let record = sync.boot();
    info!(
        "Booted {} with usage={} ml_per_pulse={} indicator={}",
        record.hostname, record.usage, record.ml_per_pulse, record.indicator
    );
    BLINK.store(record.indicator == Indicator::Blink, Ordering::Relaxed);
    let coordinator = COORDINATOR.init(Mutex::new(RefCell::new(sync)));

    // Flow sensor: open collector, one falling edge per pulse
    let mut io = Io::new(peripherals.IO_MUX);
    io.set_interrupt_handler(on_pulse);
    let mut sensor = Input::new(
        peripherals.GPIO4,
        InputConfig::default().with_pull(Pull::Up),
    );
    let led = Output::new(peripherals.GPIO2, Level::Low, OutputConfig::default());
    critical_section::with(|cs| {
        sensor.listen(Event::FallingEdge);
        SENSOR.borrow_ref_mut(cs).replace(sensor);
        LED.borrow_ref_mut(cs).replace(led);
    });

    match flush_task(coordinator) {
        Ok(token) => spawner.spawn(token),
        Err(e) => error!("Failed to spawn the flush task: {:?}", e),
    }

    loop {
        Timer::after(Duration::from_secs(ANNOUNCE_INTERVAL_SECS)).await;
        coordinator.lock(|sync| {
            let report = sync.borrow().report();
            info!(
                "{} {:.3} {:?} ({} pulses, k={})",
                report.timestamp, report.volume, report.unit, report.pulses, report.k
            );
        });
    }
}
