//! Embassy runtime: shared statics, peripheral bring-up and task spawning.
//!
//! Interrupt-side producers (IMU lines, radio UART, day clock) only ever call
//! [`post`]; the control task is the single consumer of [`EVENT_QUEUE`].

use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::adc::Adc;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::Pull;
use embassy_stm32::i2c::{self, I2c};
use embassy_stm32::time::Hertz;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use portable_atomic::{AtomicBool, Ordering};
use tracker_core::{Controller, Event, EventQueue};

use crate::config::{CONTROL_CONFIG, QUEUE_DEPTH};
use crate::hw::FirmwarePlatform;
use crate::hw::flash::InternalFlash;
use crate::hw::imu::{self, Imu};
use crate::hw::power::BoardPower;
use crate::logging;
use crate::radio::{RadioTx, UartRadio};

mod clock_task;
mod control_task;
mod radio_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

pub(crate) static EVENT_QUEUE: EventQueue<QUEUE_DEPTH> = EventQueue::new();
/// Raised by every producer after a post; the control task waits on it.
pub(crate) static WAKE: Signal<CriticalSectionRawMutex, ()> = Signal::new();
pub(crate) static RADIO_TX: RadioTx = Channel::new();
static ASLEEP: AtomicBool = AtomicBool::new(false);

pub type FirmwareController = Controller<'static, FirmwarePlatform<'static>, QUEUE_DEPTH>;

/// Hands an event to the control task.
pub fn post(event: Event) {
    if let Err(full) = EVENT_QUEUE.post(event) {
        logging::producer_drop(full.into_event().kind());
    }
    WAKE.signal(());
}

pub fn enter_deep_sleep() {
    ASLEEP.store(true, Ordering::Release);
}

pub fn is_asleep() -> bool {
    ASLEEP.load(Ordering::Acquire)
}

/// Clears the sleep flag; returns `true` if the device was asleep.
pub fn wake_from_sleep() -> bool {
    ASLEEP.swap(false, Ordering::AcqRel)
}

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let config = hal::Config::default();
    let hal::Peripherals {
        ADC1,
        EXTI0,
        EXTI1,
        FLASH,
        I2C1,
        PA0,
        PA1,
        PB0,
        PB1,
        PB8,
        PB9,
        USART5,
        ..
    } = hal::init(config);

    let storage = InternalFlash::new(Flash::new_blocking(FLASH));
    let power = BoardPower::new(Adc::new(ADC1));
    let radio = UartRadio::new(RADIO_TX.sender());
    let platform = FirmwarePlatform::new(radio, storage, power);
    let controller = Controller::new(&EVENT_QUEUE, platform, CONTROL_CONFIG);

    let bus = I2c::new_blocking(I2C1, PB8, PB9, Hertz::khz(400), i2c::Config::default());
    let data_ready = ExtiInput::new(PA0, EXTI0, Pull::Down);
    let motion = ExtiInput::new(PA1, EXTI1, Pull::Down);

    post(Event::InitComplete);

    spawner
        .spawn(control_task::run(controller))
        .expect("failed to spawn control task");
    spawner
        .spawn(radio_task::run(&RADIO_TX, USART5, PB0, PB1))
        .expect("failed to spawn radio task");
    spawner
        .spawn(imu::run(Imu::new(bus), data_ready, motion))
        .expect("failed to spawn IMU task");
    spawner
        .spawn(clock_task::run())
        .expect("failed to spawn clock task");

    core::future::pending::<()>().await;
}
