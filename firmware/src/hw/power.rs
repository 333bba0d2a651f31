//! Battery sensing, retry back-off and reset.
//!
//! The cell feeds the MCU through a low-dropout regulator that follows the
//! cell once it sags below the rail, so VDDA measured against VREFINT is the
//! battery reading the control plane needs.

use core::ptr;

use embassy_stm32::adc::{Adc, SampleTime, VrefInt};
use embassy_stm32::peripherals::ADC1;
use embassy_time::block_for;
use tracker_core::Fault;
use tracker_core::drivers::PowerControl;

use crate::config::{PARAM_RETRY_BACKOFF, VREFINT_CAL_MV};
use crate::{logging, runtime};

/// Factory VREFINT reading taken at [`VREFINT_CAL_MV`].
const VREFINT_CAL_ADDR: *const u16 = 0x1FFF_75AA as *const u16;

fn vrefint_calibration() -> u16 {
    unsafe { ptr::read_volatile(VREFINT_CAL_ADDR) }
}

/// Converts a raw VREFINT conversion into VDDA millivolts.
pub fn vdda_millivolts(calibration: u16, reading: u16) -> Option<u16> {
    if reading == 0 {
        return None;
    }
    let millivolts = VREFINT_CAL_MV * u32::from(calibration) / u32::from(reading);
    u16::try_from(millivolts).ok()
}

pub struct BoardPower<'d> {
    adc: Adc<'d, ADC1>,
    vrefint: VrefInt,
    calibration: u16,
    primed: bool,
}

impl<'d> BoardPower<'d> {
    pub fn new(mut adc: Adc<'d, ADC1>) -> Self {
        adc.set_sample_time(SampleTime::CYCLES160_5);
        let vrefint = adc.enable_vrefint();
        Self {
            adc,
            vrefint,
            calibration: vrefint_calibration(),
            primed: false,
        }
    }
}

impl PowerControl for BoardPower<'_> {
    fn sleep_yield(&mut self) {
        block_for(PARAM_RETRY_BACKOFF);
    }

    fn enter_deep_sleep(&mut self) {
        runtime::enter_deep_sleep();
    }

    fn battery_millivolts(&mut self) -> Option<u16> {
        // The first conversion after enabling VREFINT reads low.
        if !self.primed {
            let _ = self.adc.blocking_read(&mut self.vrefint);
            self.primed = true;
        }
        let reading = self.adc.blocking_read(&mut self.vrefint);
        vdda_millivolts(self.calibration, reading)
    }

    fn reset(&mut self, fault: Fault) {
        logging::fault(fault);
        cortex_m::peripheral::SCB::sys_reset();
    }
}
