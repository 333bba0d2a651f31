use embassy_time::{Duration, Ticker};
use tracker_core::Event;

use super::post;
use crate::clock::FirmwareInstant;

const DAY: Duration = Duration::from_secs(86_400);

/// Posts a day rollover stamped with seconds since boot.
#[embassy_executor::task]
pub async fn run() -> ! {
    let mut ticker = Ticker::every(DAY);
    loop {
        ticker.next().await;
        post(Event::DayRollover(FirmwareInstant::now().as_secs_u32()));
    }
}
