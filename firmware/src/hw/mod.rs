//! Binds the control-plane collaborator traits to board peripherals.

pub mod flash;
pub mod imu;
pub mod power;

use tracker_core::drivers::Platform;

use crate::classifier::StepClassifier;
use crate::clock::FirmwareInstant;
use crate::radio::UartRadio;

use self::flash::InternalFlash;
use self::imu::ImuSamples;
use self::power::BoardPower;

pub struct FirmwarePlatform<'d> {
    radio: UartRadio<'static>,
    storage: InternalFlash<'d>,
    sensor: ImuSamples,
    classifier: StepClassifier,
    power: BoardPower<'d>,
}

impl<'d> FirmwarePlatform<'d> {
    pub fn new(radio: UartRadio<'static>, storage: InternalFlash<'d>, power: BoardPower<'d>) -> Self {
        Self {
            radio,
            storage,
            sensor: ImuSamples,
            classifier: StepClassifier::new(),
            power,
        }
    }
}

impl<'d> Platform for FirmwarePlatform<'d> {
    type Instant = FirmwareInstant;
    type Radio = UartRadio<'static>;
    type Storage = InternalFlash<'d>;
    type Sensor = ImuSamples;
    type Classifier = StepClassifier;
    type Power = BoardPower<'d>;

    fn radio(&mut self) -> &mut Self::Radio {
        &mut self.radio
    }

    fn storage(&mut self) -> &mut Self::Storage {
        &mut self.storage
    }

    fn sensor(&mut self) -> &mut Self::Sensor {
        &mut self.sensor
    }

    fn classifier(&mut self) -> &mut Self::Classifier {
        &mut self.classifier
    }

    fn power(&mut self) -> &mut Self::Power {
        &mut self.power
    }
}
