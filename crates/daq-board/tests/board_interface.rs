//! Board arming and readout through the public API.

use daq_board::registers::v1724;
use daq_board::{
    open_controller, open_digitizer, BoardInterface, Calibration, ScriptedBusFactory,
};
use daq_core::{BoardConfig, BoardKind, ErrorKind, ReadoutConfig};
use daq_decoder::synth::LegacyEvent;
use daq_decoder::split_blocks;
use tracing_test::traced_test;

#[test]
#[traced_test]
fn arm_programs_board_and_applies_calibration() {
    let mut factory = ScriptedBusFactory::new();
    let bus = factory.add(100);
    let mut config = BoardConfig::digitizer(100);
    config.channel_mask = 0x3;

    let digitizer = open_digitizer(&config, &factory).unwrap();
    let iface = BoardInterface::new(100, digitizer, &ReadoutConfig::default());
    let calibration = Calibration {
        stamp: 24_010_100,
        dac: [0x1111; 8],
    };
    iface.arm(&config, Some(&calibration)).unwrap();

    let writes = bus.writes();
    assert_eq!(writes[0], (v1724::SOFTWARE_RESET, 1));
    assert_eq!(writes[1], (v1724::CHANNEL_ENABLE_MASK, 0x3));
    assert!(writes.contains(&(v1724::channel_dac(7), 0x1111)));
    assert!(logs_contain("Board armed"));
}

#[test]
fn arm_fails_when_board_never_ready() {
    let mut factory = ScriptedBusFactory::new();
    let bus = factory.add(1);
    bus.set_register(v1724::ACQUISITION_STATUS, 0);
    let config = BoardConfig::digitizer(1);
    let iface = BoardInterface::new(
        1,
        open_digitizer(&config, &factory).unwrap(),
        &ReadoutConfig::default(),
    );
    let err = iface.arm(&config, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientBus);
}

#[test]
fn drained_blocks_decode_in_order() {
    let mut factory = ScriptedBusFactory::new();
    let bus = factory.add(2);
    let config = BoardConfig::digitizer(2);
    let iface = BoardInterface::new(
        2,
        open_digitizer(&config, &factory).unwrap(),
        &ReadoutConfig::default(),
    );
    iface.activate();
    for counter in 0..5u32 {
        let records: Vec<Vec<u32>> = (0..3)
            .map(|i| LegacyEvent::uniform(0xFF, counter * 3 + i, (counter * 3 + i) * 100, 8).encode())
            .collect();
        bus.push_words(&records.concat());
        iface.read_cycle().unwrap();
    }
    let batch = iface.try_drain().unwrap();
    assert_eq!(batch.header_time, 0);
    let counters: Vec<u32> = split_blocks(batch.blocks)
        .iter()
        .map(|r| r.header.event_counter)
        .collect();
    assert_eq!(counters, (0..15).collect::<Vec<_>>());
}

#[test]
fn kinds_are_checked_when_opening() {
    let mut factory = ScriptedBusFactory::new();
    factory.add(1);
    let controller = BoardConfig {
        kind: BoardKind::V2718,
        ..BoardConfig::digitizer(1)
    };
    assert!(open_digitizer(&controller, &factory).is_err());
    assert!(open_controller(&controller, &factory).is_ok());
    assert!(open_controller(&BoardConfig::digitizer(1), &factory).is_err());
    assert!(open_digitizer(&BoardConfig::digitizer(99), &factory).is_err());
}
