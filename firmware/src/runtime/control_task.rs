use embassy_futures::select::select;
use embassy_time::Timer;

use super::{FirmwareController, WAKE};
use crate::clock::FirmwareInstant;
use crate::logging;

/// Single consumer of the event queue.
///
/// Drains everything pending, mirrors new trace records, then sleeps until a
/// producer signals or the earliest software timer is due.
#[embassy_executor::task]
pub async fn run(mut controller: FirmwareController) -> ! {
    let mut mirrored = 0;
    loop {
        if let Err(fault) = controller.settle(FirmwareInstant::now()) {
            // Power control resets the board; only reached if that returns.
            logging::fault(fault);
        }
        mirrored = logging::mirror(controller.trace(), mirrored);

        match controller.next_deadline() {
            Some(deadline) => {
                select(WAKE.wait(), Timer::at(deadline.into_embassy())).await;
            }
            None => WAKE.wait().await,
        }
    }
}
