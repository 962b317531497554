//! Drivers running end to end on the simulated chip

use embassy_futures::block_on;
use portable_atomic::{AtomicU32, Ordering};

use halcyon_hal::adc::{Adc, AdcError, ChannelConfig};
use halcyon_hal::comp::{Comp, CompConfig, CompEvent, CompMode};
use halcyon_hal::dma::{Dma, DmaConfig, DmaDirection, DmaError, DmaEvent, TransferAction};
use halcyon_hal::gpio::{DriveMode, Gpio, GpioDirection, GpioEvent};
use halcyon_hal::i2s::{I2s, I2sConfig, I2sError, I2sPins};
use halcyon_hal::pdmpcm::{PdmInput, PdmPcm, PdmPcmConfig, PdmPcmError, READ_LEN};
use halcyon_hal::rtc::{DateTime, DstDay, DstRule, Rtc};
use halcyon_hal::sdio::{Sdio, SdioConfig, SdioError, SdioPins};
use halcyon_hal::spi::{Mode, Spi, SpiConfig, SpiError, SpiEvent, SpiPins, SselPolarity};
use halcyon_hal::timer::{Divisor, Timer, TimerEvent};
use halcyon_hal::{Error, Notification, Resource, ResourceType, StatusCode, TransferEvent, WAIT_FOREVER};

use crate::{SimChip, SimDelay};

fn spi_pins() -> SpiPins {
    SpiPins {
        sclk: 10,
        mosi: Some(11),
        miso: Some(12),
        ssel: Some(13),
    }
}

fn sdio_pins() -> SdioPins {
    SdioPins {
        cmd: 30,
        clk: 31,
        data: [32, 33, 34, 35],
    }
}

#[test]
fn test_spi_blocking_loopback() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.spi();
    let spi = Spi::init(&hw, backend, 1, spi_pins(), 8, Mode::Mode0, false).unwrap();
    let mut delay = chip.delay();

    let tx = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
    let mut rx = [0u8; 20];
    spi.transfer(&tx, &mut rx, 0xFF, &mut delay, 100).unwrap();
    assert_eq!(rx, tx);
    assert_eq!(probe.wire().len(), 20);
    assert_eq!(probe.block(), Some(1));
}

#[test]
fn test_spi_second_async_is_busy() {
    static CALLS: AtomicU32 = AtomicU32::new(0);
    fn on_event(note: Notification<SpiEvent>) {
        if note.transfer.is_some() {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.spi();
    let spi = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false).unwrap();
    spi.register_callback(Some(&on_event)).unwrap();

    probe.set_loopback(false);
    probe.queue_peer_bytes(&[0x5A; 16]);
    spi.transfer_async(&[0xA5; 16], 16).unwrap();
    assert_eq!(spi.transfer_async(&[0xA5; 16], 16), Err(Error::Spi(SpiError::Busy)));

    spi.on_interrupt();
    spi.on_interrupt();
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(
        block_on(spi.wait_transfer()),
        Ok(TransferEvent::Complete { bytes: 16 })
    );
    let mut rx = [0u8; 16];
    assert_eq!(spi.take_received(&mut rx).unwrap(), 16);
    assert_eq!(rx, [0x5A; 16]);
    assert_eq!(probe.wire_bytes(), vec![0xA5; 16]);
}

#[test]
fn test_spi_invalid_configure_keeps_previous() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.spi();
    let spi = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false).unwrap();
    let before = spi.config().unwrap();

    let bad = SpiConfig {
        data_bits: 40,
        ..before
    };
    let err = spi.configure(bad).unwrap_err();
    assert_eq!(err.status(), StatusCode::InvalidArgument);
    assert_eq!(spi.config().unwrap(), before);
    assert_eq!(probe.config(), Some(before));
}

#[test]
fn test_use_after_free_and_reclaim() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.spi();
    let spi = Spi::init(&hw, backend, 2, spi_pins(), 8, Mode::Mode0, false).unwrap();

    // A pin of the bus cannot be claimed twice
    let err = Gpio::init(&hw, chip.gpio(), 11, GpioDirection::Output, DriveMode::Strong, false)
        .err()
        .unwrap();
    assert_eq!(err.status(), StatusCode::InUse);

    spi.free().unwrap();
    assert_eq!(probe.block(), None);
    assert_eq!(hw.reserved_count(), 0);
    let err = spi.transfer_async(&[1], 1).unwrap_err();
    assert_eq!(err.status(), StatusCode::NotInitialized);
    assert_eq!(spi.free().unwrap_err().status(), StatusCode::NotInitialized);

    let pin = Gpio::init(&hw, chip.gpio(), 11, GpioDirection::Output, DriveMode::Strong, true).unwrap();
    assert!(pin.read().unwrap());
}

#[test]
fn test_gpio_callback_replacement() {
    static FIRST: AtomicU32 = AtomicU32::new(0);
    static SECOND: AtomicU32 = AtomicU32::new(0);
    fn first(_: Notification<GpioEvent>) {
        FIRST.fetch_add(1, Ordering::SeqCst);
    }
    fn second(_: Notification<GpioEvent>) {
        SECOND.fetch_add(1, Ordering::SeqCst);
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let probe = chip.gpio_probe();
    let pin = Gpio::init(&hw, chip.gpio(), 5, GpioDirection::Input, DriveMode::PullUp, false).unwrap();
    pin.register_callback(Some(&first)).unwrap();
    pin.enable_event(GpioEvent::FALL, 3, true).unwrap();

    probe.drive(5, false);
    pin.on_interrupt();
    assert_eq!(FIRST.load(Ordering::SeqCst), 1);

    pin.register_callback(Some(&second)).unwrap();
    probe.drive(5, true);
    probe.drive(5, false);
    pin.on_interrupt();
    assert_eq!(FIRST.load(Ordering::SeqCst), 1);
    assert_eq!(SECOND.load(Ordering::SeqCst), 1);

    // Rising edges were never enabled
    probe.drive(5, true);
    pin.on_interrupt();
    assert_eq!(SECOND.load(Ordering::SeqCst), 1);
}

#[test]
fn test_abort_races_completion() {
    const ROUNDS: u32 = 64;
    static SETTLED: AtomicU32 = AtomicU32::new(0);
    static ABORTED: AtomicU32 = AtomicU32::new(0);
    fn on_event(note: Notification<SpiEvent>) {
        if let Some(done) = note.transfer {
            SETTLED.fetch_add(1, Ordering::SeqCst);
            if done.outcome == TransferEvent::Aborted {
                ABORTED.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, _probe) = chip.spi();
    let spi = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false).unwrap();
    spi.register_callback(Some(&on_event)).unwrap();

    for _ in 0..ROUNDS {
        spi.transfer_async(&[0x11; 8], 8).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| spi.on_interrupt());
            s.spawn(|| spi.abort_async().unwrap());
        });
        // Whichever lost the race, the slot is idle again
        spi.on_interrupt();
        assert!(!spi.is_busy().unwrap());
    }
    assert_eq!(SETTLED.load(Ordering::SeqCst), ROUNDS);
    assert!(ABORTED.load(Ordering::SeqCst) <= ROUNDS);
}

fn copy_config(src: u32, dst: u32, words: u32) -> DmaConfig {
    DmaConfig {
        src_addr: src,
        src_increment: true,
        dst_addr: dst,
        dst_increment: true,
        transfer_width: 32,
        length: words,
        burst_size: 1,
        action: TransferAction::Full,
    }
}

#[test]
fn test_dma_memory_copy() {
    static DONE: AtomicU32 = AtomicU32::new(0);
    fn on_event(note: Notification<DmaEvent>) {
        if note.events.contains(DmaEvent::TRANSFER_COMPLETE) {
            DONE.fetch_add(1, Ordering::SeqCst);
        }
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let memory = chip.memory();
    let sram = memory.base();
    let pattern: Vec<u8> = (0u8..16).collect();
    memory.write(sram, &pattern);

    let (backend, probe) = chip.dma();
    let dma = Dma::init_with_map(&hw, backend, DmaDirection::MemToMem, chip.description().dma_map)
        .unwrap();
    dma.configure(&copy_config(sram, sram + 0x400, 4)).unwrap();
    assert!(hw.is_reserved(Resource::channel(ResourceType::Dma, 0, 1)).unwrap());

    assert_eq!(
        dma.start_transfer().unwrap_err(),
        Error::Dma(DmaError::ChannelDisabled)
    );
    dma.enable().unwrap();
    dma.register_callback(Some(&on_event)).unwrap();
    dma.enable_event(DmaEvent::TRANSFER_COMPLETE, 1, true).unwrap();
    dma.start_transfer().unwrap();
    dma.on_interrupt();

    assert_eq!(block_on(dma.wait_transfer()), Ok(TransferEvent::Complete { bytes: 16 }));
    assert_eq!(DONE.load(Ordering::SeqCst), 1);
    assert_eq!(memory.read(sram + 0x400, 16), Some(pattern));
    assert_eq!(probe.completed(), 1);

    dma.free().unwrap();
    assert_eq!(hw.reserved_count(), 0);
}

#[test]
fn test_dma_channel_conflict() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let sram = chip.memory().base();
    let (a, _) = chip.dma();
    let (b, _) = chip.dma();
    let copy = Dma::init(&hw, a, DmaDirection::MemToMem).unwrap();
    let feed = Dma::init(&hw, b, DmaDirection::MemToPeriph).unwrap();

    copy.configure(&copy_config(sram, sram + 0x40, 1)).unwrap();
    // Memory to SCB shares the memory-to-memory channel
    let err = feed
        .configure(&DmaConfig {
            dst_increment: false,
            ..copy_config(sram, 0x0040_0000, 1)
        })
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::InUse);
    assert_eq!(feed.channel().unwrap(), None);

    // TDM 0 has a channel of its own
    feed.configure(&DmaConfig {
        dst_increment: false,
        ..copy_config(sram, 0x0041_0000, 1)
    })
    .unwrap();
    assert_eq!(feed.channel().unwrap(), Some(4));
}

#[test]
fn test_i2s_write_then_read() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.i2s();
    let tx = I2sPins {
        sck: 20,
        ws: 21,
        data: 22,
        mclk: None,
    };
    let rx = I2sPins {
        sck: 23,
        ws: 24,
        data: 25,
        mclk: None,
    };
    let i2s = I2s::init(&hw, backend, 0, Some(tx), Some(rx), I2sConfig::default()).unwrap();
    let mut delay = chip.delay();

    i2s.start_tx().unwrap();
    i2s.write(&[1, 2, 3, 4], &mut delay, 10).unwrap();
    assert!(i2s.is_tx_busy().unwrap());
    probe.shift(4);
    assert!(!i2s.is_tx_busy().unwrap());
    assert_eq!(probe.drained(), vec![1, 2, 3, 4]);

    probe.feed(&[9, 8, 7]);
    i2s.start_rx().unwrap();
    let mut buf = [0u32; 3];
    assert_eq!(i2s.read(&mut buf, &mut delay, 10).unwrap(), 3);
    assert_eq!(buf, [9, 8, 7]);

    // Nothing more on the line: a blocking read runs out of time
    let mut one = [0u32; 1];
    let err = i2s.read(&mut one, &mut delay, 2).unwrap_err();
    assert_eq!(err.status(), StatusCode::Timeout);
}

#[test]
fn test_sdio_blocking_read_with_host() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.sdio();
    let sdio = Sdio::init(&hw, backend, sdio_pins()).unwrap();
    sdio.configure(SdioConfig::default()).unwrap();
    assert!(!sdio.is_ready().unwrap());
    assert_eq!(
        sdio.mailbox_read().unwrap_err(),
        Error::Sdio(SdioError::NotReady)
    );

    probe.enable_host_io(true);
    assert!(sdio.is_ready().unwrap());
    assert!(probe.io_ready());

    // The host answers three milliseconds into the wait
    let host = probe.clone();
    let start = chip.clock().now_ns();
    let mut sent = false;
    let mut delay = SimDelay::with_hook(chip.clock(), move |now| {
        if !sent && now - start >= 3_000_000 {
            host.host_send(b"hello");
            sent = true;
        }
    });
    let mut buf = [0u8; 64];
    let n = sdio.read(&mut buf, &mut delay, 10).unwrap();
    assert_eq!(&buf[..n], b"hello");

    sdio.write(b"world", &mut delay, WAIT_FOREVER).unwrap();
    assert_eq!(probe.host_take().as_deref(), Some(&b"world"[..]));
}

#[test]
fn test_sdio_read_times_out() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.sdio();
    let sdio = Sdio::init(&hw, backend, sdio_pins()).unwrap();
    sdio.configure(SdioConfig::default()).unwrap();
    probe.enable_host_io(true);
    assert!(sdio.is_ready().unwrap());

    let clock = chip.clock();
    let mut delay = chip.delay();
    let mut buf = [0u8; 8];
    let err = sdio.read(&mut buf, &mut delay, 5).unwrap_err();
    assert_eq!(err, Error::Sdio(SdioError::Timeout));
    assert_eq!(clock.now_ns(), 5_000_000);
    assert!(!sdio.is_busy().unwrap());
}

#[test]
fn test_timer_expires_with_clock() {
    static EXPIRED: AtomicU32 = AtomicU32::new(0);
    fn on_event(note: Notification<TimerEvent>) {
        if note.events.contains(TimerEvent::TERMINAL_COUNT) {
            EXPIRED.fetch_add(1, Ordering::SeqCst);
        }
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let clock = chip.clock();
    let (backend, probe) = chip.timer();
    let timer = Timer::init(&hw, backend, None).unwrap();
    assert_eq!(probe.instance(), Some(timer.instance()));
    timer.register_callback(Some(&on_event)).unwrap();
    timer.enable_event(TimerEvent::TERMINAL_COUNT, 2, true).unwrap();

    timer.start().unwrap();
    clock.advance_ms(40);
    assert_eq!(timer.read().unwrap(), 60_000);
    clock.advance_ms(60);
    timer.on_interrupt();
    assert_eq!(EXPIRED.load(Ordering::SeqCst), 1);

    // A 62.5 kHz counter counts in steps of 16 base ticks
    timer.set_frequency(62_500).unwrap();
    assert_eq!(timer.divisor().unwrap(), Divisor::Div16);
    assert_eq!(timer.read().unwrap(), 100_000 * 16);
}

fn us_dst() -> (DstRule, DstRule) {
    let start = DstRule {
        month: 3,
        hour: 2,
        day: DstDay::Relative {
            week_of_month: 1,
            day_of_week: 0,
        },
    };
    let stop = DstRule {
        month: 11,
        hour: 2,
        day: DstDay::Relative {
            week_of_month: 0,
            day_of_week: 0,
        },
    };
    (start, stop)
}

#[test]
fn test_rtc_dst_follows_clock() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let clock = chip.clock();
    let (backend, _) = chip.rtc();
    let rtc = Rtc::init(&hw, backend).unwrap();
    let (start, stop) = us_dst();

    rtc.write(&DateTime::new(2024, 3, 10, 1, 59, 0).unwrap()).unwrap();
    rtc.set_dst(start, stop).unwrap();
    assert!(!rtc.is_dst().unwrap());

    clock.advance_secs(61);
    let t = rtc.read().unwrap();
    assert_eq!((t.hour, t.minute, t.second), (3, 0, 1));
    assert!(rtc.is_dst().unwrap());

    rtc.write(&DateTime::new(2024, 11, 3, 0, 30, 0).unwrap()).unwrap();
    assert!(rtc.is_dst().unwrap());
    clock.advance_secs(3600);
    let t = rtc.read().unwrap();
    assert_eq!((t.hour, t.minute), (0, 30));
    assert!(!rtc.is_dst().unwrap());

    // The repeated hour stays in standard time
    clock.advance_secs(3600);
    let t = rtc.read().unwrap();
    assert_eq!((t.hour, t.minute), (1, 30));
    assert!(!rtc.is_dst().unwrap());
}

#[test]
fn test_rtc_time_survives_handle() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, probe) = chip.rtc();

    let rtc = Rtc::init(&hw, backend.clone()).unwrap();
    assert!(!rtc.is_enabled().unwrap());
    assert_eq!(rtc.read().unwrap(), DateTime::default());
    rtc.write_direct(0, 0, 8, 15, 7, 2030).unwrap();
    drop(rtc);

    chip.clock().advance_secs(5);
    let rtc = Rtc::init(&hw, backend.clone()).unwrap();
    assert!(rtc.is_enabled().unwrap());
    assert_eq!(rtc.read().unwrap().second, 5);
    drop(rtc);

    probe.power_loss();
    let rtc = Rtc::init(&hw, backend).unwrap();
    assert!(!rtc.is_enabled().unwrap());
    assert_eq!(rtc.read().unwrap().year, DateTime::default().year);
}

#[test]
fn test_reduced_chip_layout() {
    let chip = SimChip::from_toml(
        r#"
        name = "one-scb"

        [layout]
        scb = { blocks = 1, channels = 1 }
        "#,
    )
    .unwrap();
    let hw = chip.hw_manager().unwrap();

    let (backend, _) = chip.spi();
    let err = Spi::init(&hw, backend, 2, spi_pins(), 8, Mode::Mode0, false)
        .err()
        .unwrap();
    assert_eq!(err.status(), StatusCode::InvalidArgument);
    assert_eq!(hw.reserved_count(), 0);

    let (backend, _) = chip.spi();
    let spi = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false).unwrap();
    assert_eq!(spi.config().unwrap().data_bits, 8);
}

#[test]
fn test_spi_unroutable_pin_claims_nothing() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, bus) = chip.spi();
    let pins = SpiPins {
        sclk: 40,
        ..spi_pins()
    };
    let err = Spi::init(&hw, backend, 0, pins, 8, Mode::Mode0, false)
        .err()
        .unwrap();
    assert_eq!(err, Error::Spi(SpiError::InvalidPin));
    assert_eq!(hw.reserved_count(), 0);
    assert_eq!(bus.block(), None);

    // MISO and MOSI swapped
    let (backend, _) = chip.spi();
    let pins = SpiPins {
        mosi: Some(12),
        miso: Some(11),
        ..spi_pins()
    };
    let err = Spi::init(&hw, backend, 0, pins, 8, Mode::Mode0, false)
        .err()
        .unwrap();
    assert_eq!(err, Error::Spi(SpiError::InvalidPin));
    assert_eq!(hw.reserved_count(), 0);

    let (backend, bus) = chip.spi();
    let spi = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false).unwrap();
    let held = hw.reserved_count();
    assert_eq!(
        spi.slave_select_config(41, SselPolarity::ActiveLow),
        Err(Error::Spi(SpiError::InvalidPin))
    );
    assert_eq!(hw.reserved_count(), held);
    spi.slave_select_config(14, SselPolarity::ActiveHigh).unwrap();
    assert_eq!(bus.slave_selects(), vec![(14, SselPolarity::ActiveHigh)]);
}

#[test]
fn test_i2s_unroutable_pin_claims_nothing() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, line) = chip.i2s();
    // Transmit clock pin used for the receive half
    let rx = I2sPins {
        sck: 20,
        ws: 24,
        data: 25,
        mclk: None,
    };
    let err = I2s::init(&hw, backend, 0, None, Some(rx), I2sConfig::default())
        .err()
        .unwrap();
    assert_eq!(err, Error::I2s(I2sError::InvalidPin));
    assert_eq!(hw.reserved_count(), 0);
    assert!(line.config().is_none());

    let (backend, _) = chip.i2s();
    let tx = I2sPins {
        sck: 20,
        ws: 21,
        data: 22,
        mclk: Some(27),
    };
    let err = I2s::init(&hw, backend, 0, Some(tx), None, I2sConfig::default())
        .err()
        .unwrap();
    assert_eq!(err, Error::I2s(I2sError::InvalidPin));
    assert_eq!(hw.reserved_count(), 0);
}

#[test]
fn test_sdio_unroutable_pin_claims_nothing() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, host) = chip.sdio();
    let pins = SdioPins {
        data: [32, 33, 34, 40],
        ..sdio_pins()
    };
    let err = Sdio::init(&hw, backend, pins).err().unwrap();
    assert_eq!(err, Error::Sdio(SdioError::InvalidPin));
    assert_eq!(hw.reserved_count(), 0);
    assert!(!host.io_ready());

    let (backend, _) = chip.sdio();
    assert!(Sdio::init(&hw, backend, sdio_pins()).is_ok());
}

#[test]
fn test_custom_routes_move_spi_pins() {
    let chip = SimChip::from_toml(
        r#"
        [[routes]]
        pin = 2
        function = "spi_clk"

        [[routes]]
        pin = 3
        function = "spi_mosi"
        "#,
    )
    .unwrap();
    let hw = chip.hw_manager().unwrap();
    let (backend, _) = chip.spi();
    let err = Spi::init(&hw, backend, 0, spi_pins(), 8, Mode::Mode0, false)
        .err()
        .unwrap();
    assert_eq!(err, Error::Spi(SpiError::InvalidPin));

    let (backend, bus) = chip.spi();
    let pins = SpiPins {
        sclk: 2,
        mosi: Some(3),
        miso: None,
        ssel: None,
    };
    let _spi = Spi::init(&hw, backend, 0, pins, 8, Mode::Mode0, false).unwrap();
    assert_eq!(bus.block(), Some(0));
}

#[test]
fn test_pdm_digital_mic_read() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, mic) = chip.pdmpcm();
    let config = PdmPcmConfig::default();
    let pdm = PdmPcm::init(&hw, backend, PdmInput::Digital { clk: 16, data: 17 }, config).unwrap();
    let mut delay = chip.delay();

    pdm.start().unwrap();
    assert!(mic.is_running());
    let settling = config.settling_halves() as usize;
    mic.feed_tone(-5, settling);
    mic.feed_tone(1234, 1);

    let mut buf = [0i16; READ_LEN];
    assert_eq!(pdm.read(&mut buf, &mut delay).unwrap(), READ_LEN);
    assert!(buf.iter().all(|&s| s == 1234));
    assert!(pdm.is_enabled().unwrap());
    assert_eq!(mic.queued(), 0);

    let err = pdm.read(&mut buf, &mut delay).unwrap_err();
    assert_eq!(err, Error::PdmPcm(PdmPcmError::Timeout));
    assert!(!pdm.is_pending().unwrap());
}

#[test]
fn test_pdm_analog_mic_owns_front_end() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, mic) = chip.pdmpcm();
    let pdm = PdmPcm::init(&hw, backend, PdmInput::Analog { mic: 52 }, PdmPcmConfig::default()).unwrap();

    assert_eq!(
        pdm.start(),
        Err(Error::PdmPcm(PdmPcmError::FrontEndNotReady))
    );
    mic.set_front_end_ready(true);
    pdm.start().unwrap();

    // The front end and the noise detector belong to the microphone now
    let (backend, _) = chip.adc();
    let err = Adc::init(&hw, backend, 0).err().unwrap();
    assert_eq!(err.status(), StatusCode::InUse);
    let (backend, _) = chip.comp();
    let err = Comp::init(&hw, backend, 46, Some(44), None, &CompConfig::default())
        .err()
        .unwrap();
    assert_eq!(err.status(), StatusCode::InUse);

    pdm.free().unwrap();
    assert_eq!(hw.reserved_count(), 0);
    assert_eq!(mic.input(), None);
}

#[test]
fn test_adc_measures_pins() {
    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, inputs) = chip.adc();
    let adc = Adc::init(&hw, backend, 0).unwrap();
    let mut delay = chip.delay();

    inputs.set_uv(44, 300_000);
    inputs.set_counts(45, -100);
    let a = adc.channel(44, None, ChannelConfig::default()).unwrap();
    let b = adc.channel(45, None, ChannelConfig::default()).unwrap();
    assert_eq!(
        adc.channel(10, None, ChannelConfig::default()).err(),
        Some(Error::Adc(AdcError::InvalidPin))
    );
    assert_eq!(hw.reserved_count(), 3);

    assert_eq!(
        a.read_uv(&mut delay),
        Err(Error::Adc(AdcError::NotCalibrated))
    );
    adc.on_interrupt();
    assert_eq!(a.read_uv(&mut delay), Ok(299_987));
    assert_eq!(b.read(&mut delay), Ok(-100));

    adc.read_async(2).unwrap();
    while adc.is_pending().unwrap() {
        adc.on_interrupt();
    }
    assert_eq!(
        block_on(adc.wait_read()),
        Ok(TransferEvent::Complete { bytes: 16 })
    );
    let mut buf = [0i32; 4];
    assert_eq!(adc.take_read(&mut buf).unwrap(), 4);
    assert_eq!(buf, [9830, -100, 9830, -100]);

    drop(b);
    assert_eq!(inputs.routed(), vec![44]);
    adc.free().unwrap();
    assert!(!inputs.is_powered());
    assert_eq!(hw.reserved_count(), 0);
}

#[test]
fn test_comp_rising_edge_and_noise_detect() {
    static EDGES: AtomicU32 = AtomicU32::new(0);
    fn on_event(note: Notification<CompEvent>) {
        if note.events.contains(CompEvent::RISING_EDGE) {
            EDGES.fetch_add(1, Ordering::SeqCst);
        }
    }

    let chip = SimChip::reference();
    let hw = chip.hw_manager().unwrap();
    let (backend, inputs) = chip.comp();
    let dc = Comp::init(&hw, backend.clone(), 50, Some(48), None, &CompConfig::default()).unwrap();
    let mut delay = chip.delay();

    inputs.set_uv(48, 1_000_000);
    inputs.set_uv(50, 200_000);
    assert_eq!(dc.read(&mut delay), Ok(false));
    inputs.set_uv(50, 1_200_000);
    assert_eq!(dc.read(&mut delay), Ok(true));

    dc.register_callback(Some(&on_event)).unwrap();
    dc.enable_event(CompEvent::RISING_EDGE, 2, true).unwrap();
    inputs.set_uv(50, 0);
    dc.on_interrupt();
    assert_eq!(EDGES.load(Ordering::SeqCst), 0);
    inputs.set_uv(50, 1_500_000);
    dc.on_interrupt();
    assert_eq!(EDGES.load(Ordering::SeqCst), 1);

    let noise = Comp::init(&hw, backend, 52, None, None, &CompConfig::default()).unwrap();
    assert_eq!(noise.mode(), Ok(CompMode::NoiseDetect));
    assert_eq!(inputs.mode(0), Some(CompMode::NoiseDetect));
    assert_eq!(noise.read(&mut delay), Ok(false));
    inputs.set_noise(true);
    assert_eq!(noise.read(&mut delay), Ok(true));
}
