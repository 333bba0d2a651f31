use embassy_futures::join::join;
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use static_cell::StaticCell;

use super::post;
use crate::config::{RADIO_TX_DEPTH, RADIO_UART_BAUD};
use crate::radio::{FrameDecoder, MAX_FRAME, RadioTx};

const RADIO_UART_BUFFER_SIZE: usize = MAX_FRAME * RADIO_TX_DEPTH;
const UART_ERROR_BACKOFF: Duration = Duration::from_millis(5);

static UART_TX_BUFFER: StaticCell<[u8; RADIO_UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; RADIO_UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

/// Shuttles frames between the control plane and the radio co-processor.
#[embassy_executor::task]
pub async fn run(
    outbound: &'static RadioTx,
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = RADIO_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; RADIO_UART_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; RADIO_UART_BUFFER_SIZE]),
        UartIrqs,
        config,
    )
    .expect("failed to initialize radio UART");

    let (mut uart_tx, mut uart_rx) = uart.split();
    let requests = outbound.receiver();

    let to_radio = async move {
        loop {
            let frame = requests.receive().await;
            if uart_tx.write_all(&frame).await.is_err() || uart_tx.flush().await.is_err() {
                defmt::warn!("radio: UART write error, frame dropped");
                Timer::after(UART_ERROR_BACKOFF).await;
            }
        }
    };

    let from_radio = async move {
        let mut decoder = FrameDecoder::new();
        let mut ingress = [0u8; MAX_FRAME];
        loop {
            match uart_rx.read(&mut ingress).await {
                Ok(count) => {
                    for byte in &ingress[..count] {
                        match decoder.push(*byte) {
                            Some(Ok(event)) => post(event),
                            Some(Err(error)) => {
                                defmt::warn!("radio: {}", defmt::Display2Format(&error));
                            }
                            None => {}
                        }
                    }
                }
                Err(_) => {
                    defmt::warn!("radio: UART read error");
                    Timer::after(UART_ERROR_BACKOFF).await;
                }
            }
        }
    };

    join(to_radio, from_radio).await;
    loop {
        core::future::pending::<()>().await;
    }
}
