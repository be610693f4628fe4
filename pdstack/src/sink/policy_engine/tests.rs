//! Tests for the sink policy engine.

use super::{Sink, State};
use crate::config::PortConfig;
use crate::counters::{Counter, CounterType};
use crate::dummy::{
    DUMMY_CAPABILITIES, DummyDriver, DummySinkDevice, DummySinkEprDevice, DummyTimer, MAX_DATA_MESSAGE_SIZE,
    build_source_caps_frame, get_dummy_source_capabilities,
};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::epr_mode::{Action, EprModeDataObject};
use crate::protocol_layer::message::data::request::PowerSource;
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject};
use crate::protocol_layer::message::extended::chunked::ChunkedMessageSender;
use crate::protocol_layer::message::extended::extended_control::{ExtendedControl, ExtendedControlMessageType};
use crate::protocol_layer::message::extended::{Extended, ExtendedHeader};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, ExtendedMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::{DataRole, PowerRole};
use pdstack_traits::Sop;

type TestSink<'a, DPM> = Sink<'a, DummyDriver<MAX_DATA_MESSAGE_SIZE>, DummyTimer, DPM>;

/// Get a header template for simulating source messages (Source/Dfp roles).
fn source_header_template() -> Header {
    Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X)
}

fn simulate_source_control_message<DPM: crate::sink::device_policy_manager::DevicePolicyManager>(
    policy_engine: &mut TestSink<DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];

    let len = Message::new(Header::new_control(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);
}

/// Simulate an EPR_Mode data message from the source.
fn simulate_source_epr_mode_message<DPM: crate::sink::device_policy_manager::DevicePolicyManager>(
    policy_engine: &mut TestSink<DPM>,
    action: Action,
    message_id: u8,
) {
    let header = Header::new_data(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        DataMessageType::EprMode,
        1,
    );

    let epr_mode = EprModeDataObject::default().with_action(action);
    let message = Message::new_with_data(header, Data::EprMode(epr_mode));

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = message.to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);
}

/// Simulate an EprKeepAliveAck extended control message from the source.
fn simulate_epr_keep_alive_ack<DPM: crate::sink::device_policy_manager::DevicePolicyManager>(
    policy_engine: &mut TestSink<DPM>,
    message_id: u8,
) {
    let header = Header::new_extended(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        ExtendedMessageType::ExtendedControl,
        1,
    );

    let message = Message::new_with_extended(
        header,
        Extended::ExtendedControl(
            ExtendedControl::default().with_message_type(ExtendedControlMessageType::EprKeepAliveAck),
        ),
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = message.to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);
}

/// Inject a chunked extended frame as the source would transmit it.
fn simulate_source_chunk<DPM: crate::sink::device_policy_manager::DevicePolicyManager>(
    policy_engine: &mut TestSink<DPM>,
    message_type: ExtendedMessageType,
    ext_header: ExtendedHeader,
    chunk: &[u8],
    message_id: u8,
) {
    let num_objects = (2 + chunk.len()).div_ceil(4) as u8;
    let header = Header::new_extended(
        source_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        message_type,
        num_objects,
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let mut offset = header.to_bytes(&mut buf);
    offset += ext_header.to_bytes(&mut buf[offset..]);
    buf[offset..offset + chunk.len()].copy_from_slice(chunk);
    offset += chunk.len();
    while (offset - 2) % 4 != 0 {
        offset += 1;
    }

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..offset]);
}

fn probe_good_crc<DPM: crate::sink::device_policy_manager::DevicePolicyManager>(policy_engine: &mut TestSink<DPM>) {
    let (_, good_crc) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));
}

#[tokio::test]
async fn test_negotiation() {
    let config = PortConfig::default();
    let mut device = DummySinkDevice {};

    // Instantiated in `Discovery` state.
    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    // Provide capabilities.
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    // `Discovery` -> `WaitForCapabilities`
    policy_engine.run_step().await.unwrap();

    // `WaitForCapabilities` -> `EvaluateCapabilities`
    policy_engine.run_step().await.unwrap();
    probe_good_crc(&mut policy_engine);

    // `EvaluateCapabilities` -> `SelectCapability`
    policy_engine.run_step().await.unwrap();

    // GoodCRC for the Request this port will transmit, then Accept.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);

    // `SelectCapability` -> `TransitionSink`
    policy_engine.run_step().await.unwrap();

    let (_, request) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        request.header.message_type(),
        MessageType::Data(DataMessageType::Request)
    ));

    // The default policy picks the highest-power fixed PDO: 15 V at 3 A.
    if let Some(Payload::Data(Data::Request(PowerSource::Unknown(rdo)))) = request.payload {
        assert_eq!(rdo.object_position(), 3);
    } else {
        panic!("expected a request payload, got {:?}", request.payload);
    }

    probe_good_crc(&mut policy_engine); // For the Accept.

    // Simulate `PsRdy` message.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);

    // `TransitionSink` -> `Ready`
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    probe_good_crc(&mut policy_engine); // For the PsRdy.
    assert!(!policy_engine.protocol_layer.driver().has_transmitted_data());
}

#[tokio::test]
async fn test_reject_without_contract_returns_to_wait_for_capabilities() {
    let config = PortConfig::default();
    let mut device = DummySinkDevice {};

    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);

    policy_engine.run_step().await.unwrap(); // Discovery
    policy_engine.run_step().await.unwrap(); // WaitForCapabilities
    policy_engine.run_step().await.unwrap(); // EvaluateCapabilities

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Reject, 1);

    // `SelectCapability` -> back to `WaitForCapabilities`: the request was
    // rejected before any explicit contract existed.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::WaitForCapabilities));
}

#[tokio::test]
async fn test_get_sink_cap_response() {
    let mut config = PortConfig::default();
    // One 5 V / 900 mA sink PDO is configured by default.
    config.snk_pdo_mask = 0x01;
    let mut device = DummySinkDevice {};

    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    // Bring the engine into Ready through a plain negotiation.
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // The partner asks for our sink capabilities.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GetSinkCap, 3);

    // Ready -> GiveSinkCap
    policy_engine.run_step().await.unwrap();
    probe_good_crc(&mut policy_engine);

    // GoodCRC for the Sink_Capabilities response.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // GiveSinkCap -> Ready
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    let (_, response) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        response.header.message_type(),
        MessageType::Data(DataMessageType::SinkCapabilities)
    ));
    assert_eq!(response.header.num_objects(), 1);
}

#[tokio::test]
async fn test_dr_swap_accept_flips_data_role() {
    let config = PortConfig::default();
    let mut device = DummySinkDevice {};

    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    policy_engine.run_step().await.unwrap();

    assert!(matches!(policy_engine.protocol_layer.data_role(), DataRole::Ufp));

    // The partner requests a data role swap.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::DrSwap, 3);

    // Ready -> EvaluateSwap
    policy_engine.run_step().await.unwrap();

    // GoodCRC for our Accept.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // EvaluateSwap -> Ready, with the data role flipped.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    assert!(matches!(policy_engine.protocol_layer.data_role(), DataRole::Dfp));
}

#[tokio::test]
async fn test_hard_reset_from_partner_recovers_to_startup() {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::events::{AppEvent, EventHandler};
    use crate::sink::device_policy_manager::DevicePolicyManager;

    struct RecordingSinkDevice {
        events: Rc<RefCell<std::vec::Vec<AppEvent>>>,
    }

    impl EventHandler for RecordingSinkDevice {
        async fn handle_event(&mut self, event: AppEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    impl DevicePolicyManager for RecordingSinkDevice {}

    let config = PortConfig::default();
    let events = Rc::new(RefCell::new(std::vec::Vec::new()));
    let mut device = RecordingSinkDevice {
        events: events.clone(),
    };

    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    // Negotiate up to Ready.
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);
    policy_engine.run_step().await.unwrap();
    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));

    // Hard reset signalling arrives in the Ready state.
    policy_engine.protocol_layer.driver().inject_hard_reset();
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::TransitionToDefault));

    // The source cycles VBus; the dummy driver reports both transitions
    // immediately, so recovery completes within one step.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Startup));

    let events = events.borrow();
    assert!(events.iter().any(|event| matches!(event, AppEvent::HardResetReceived)));
    assert!(events.iter().any(|event| matches!(event, AppEvent::HardResetComplete)));
}

#[tokio::test]
async fn test_epr_negotiation() {
    // SPR capabilities whose vSafe5V PDO announces EPR capability.
    let mut epr_capable_pdos = get_dummy_source_capabilities();
    if let PowerDataObject::FixedSupply(supply) = &mut epr_capable_pdos[0] {
        *supply = supply.with_epr_mode_capable(true);
    }

    let mut config = PortConfig::default();
    config.epr_snk_pdos.push(0x0003_05F4).ok(); // 28 V fixed sink PDO.
    config.epr_snk_pdo_mask = 0x01;

    let mut device = DummySinkEprDevice::new();
    let mut policy_engine: TestSink<_> = Sink::new(DummyDriver::new(), &mut device, &config);

    // === Phase 1: initial SPR negotiation ===
    let caps_frame = build_source_caps_frame(&epr_capable_pdos, 0);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &caps_frame);

    policy_engine.run_step().await.unwrap(); // Discovery -> WaitForCapabilities
    policy_engine.run_step().await.unwrap(); // -> EvaluateCapabilities
    probe_good_crc(&mut policy_engine);

    policy_engine.run_step().await.unwrap(); // -> SelectCapability

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 1);
    policy_engine.run_step().await.unwrap(); // -> TransitionSink

    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 2);
    policy_engine.run_step().await.unwrap(); // -> Ready
    assert!(matches!(policy_engine.state, State::Ready(..)));

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // === Phase 2: EPR mode entry ===
    // Ready -> EprModeEntry (the DPM raises EnterEprMode).
    policy_engine.run_step().await.unwrap();

    // GoodCRC for EPR_Mode (Enter), then the source's acknowledgement.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    simulate_source_epr_mode_message(&mut policy_engine, Action::EnterAcknowledged, 3);

    // EprModeEntry -> EprEntryWaitForResponse
    policy_engine.run_step().await.unwrap();

    let (_, epr_enter) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        epr_enter.header.message_type(),
        MessageType::Data(DataMessageType::EprMode)
    ));
    let Some(Payload::Data(Data::EprMode(mode))) = epr_enter.payload else {
        panic!("expected EPR mode payload");
    };
    assert_eq!(mode.action(), Action::Enter);
    assert_eq!(mode.data(), 140); // The sink's operational PDP in watts.
    probe_good_crc(&mut policy_engine); // For EnterAcknowledged.

    // EnterSucceeded moves the engine to EprWaitForCapabilities.
    simulate_source_epr_mode_message(&mut policy_engine, Action::EnterSucceeded, 4);
    policy_engine.run_step().await.unwrap();
    probe_good_crc(&mut policy_engine);

    // === Phase 3: chunked EPR source capabilities ===
    // The seven SPR PDOs plus a 28 V / 5 A EPR PDO: 32 payload bytes, split
    // into chunks of 26 and 6 bytes.
    let mut epr_pdos = epr_capable_pdos.clone();
    epr_pdos.push(PowerDataObject::FixedSupply(
        FixedSupply::default().with_raw_voltage(560).with_raw_max_current(500),
    ));
    let mut payload = [0u8; 64];
    let mut offset = 0;
    for pdo in &epr_pdos {
        payload[offset..offset + 4].copy_from_slice(&pdo.to_raw().to_le_bytes());
        offset += 4;
    }
    assert_eq!(offset, 32);

    let mut sender = ChunkedMessageSender::new(&payload[..offset]);
    let (chunk_0_header, chunk_0) = sender.next().unwrap();
    let (chunk_1_header, chunk_1) = sender.next().unwrap();

    simulate_source_chunk(
        &mut policy_engine,
        ExtendedMessageType::EprSourceCapabilities,
        chunk_0_header,
        chunk_0,
        5,
    );
    // GoodCRC for the chunk request this port sends in between.
    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);
    simulate_source_chunk(
        &mut policy_engine,
        ExtendedMessageType::EprSourceCapabilities,
        chunk_1_header,
        chunk_1,
        6,
    );

    // EprWaitForCapabilities assembles both chunks -> EvaluateCapabilities.
    policy_engine.run_step().await.unwrap();

    probe_good_crc(&mut policy_engine); // Chunk 0.

    // The chunk request per spec 6.12.2.1.2.4.
    let (_, chunk_request_raw) = policy_engine.protocol_layer.driver().probe_transmitted_data();
    let (chunk_request_header, chunk_request_ext, _) = Message::parse_extended_chunk(&chunk_request_raw).unwrap();
    assert!(matches!(
        chunk_request_header.message_type(),
        MessageType::Extended(ExtendedMessageType::EprSourceCapabilities)
    ));
    assert!(chunk_request_ext.request_chunk());
    assert_eq!(chunk_request_ext.chunk_number(), 1);

    probe_good_crc(&mut policy_engine); // Chunk 1.

    // === Phase 4: EPR power negotiation ===
    // EvaluateCapabilities selects the 28 V EPR PDO in object position 8.
    policy_engine.run_step().await.unwrap();

    simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);
    simulate_source_control_message(&mut policy_engine, ControlMessageType::Accept, 7);

    // SelectCapability -> TransitionSink
    policy_engine.run_step().await.unwrap();

    let (_, epr_request) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        epr_request.header.message_type(),
        MessageType::Data(DataMessageType::EprRequest)
    ));
    let Some(Payload::Data(Data::Request(PowerSource::EprRequest(epr)))) = epr_request.payload else {
        panic!("expected an EPR request payload");
    };
    assert_eq!(epr.object_position(), 8);
    if let PowerDataObject::FixedSupply(fixed) = epr.pdo {
        assert_eq!(fixed.raw_voltage(), 560, "28V = 560 * 50mV");
        assert_eq!(fixed.raw_max_current(), 500, "5A = 500 * 10mA");
    } else {
        panic!("expected a fixed supply PDO mirror");
    }

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    simulate_source_control_message(&mut policy_engine, ControlMessageType::PsRdy, 0);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready(..)));
    probe_good_crc(&mut policy_engine);

    // === Phase 5: EPR keep-alive ===
    // The transmit counter stands at 4 after the EPR request; each cycle
    // consumes one transmit ID, and the ack IDs keep incrementing on the
    // source side.
    for cycle in 0u8..3 {
        let State::Ready(power_source, _) = policy_engine.state.clone() else {
            panic!("expected Ready before a keep-alive cycle");
        };
        // Normally triggered by SinkEPRKeepAliveTimer in the Ready state.
        policy_engine.state = State::EprKeepAlive(power_source);

        simulate_source_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 4 + cycle);
        simulate_epr_keep_alive_ack(&mut policy_engine, 1 + cycle);

        policy_engine.run_step().await.unwrap();

        let (_, frame) = policy_engine.protocol_layer.driver().probe_transmitted_message();
        assert!(matches!(
            frame.header.message_type(),
            MessageType::Extended(ExtendedMessageType::ExtendedControl)
        ));
        let Some(Payload::Extended(Extended::ExtendedControl(control))) = frame.payload else {
            panic!("expected extended control payload");
        };
        assert_eq!(control.message_type(), ExtendedControlMessageType::EprKeepAlive);
        assert_eq!(frame.header.message_id(), 4 + cycle);

        probe_good_crc(&mut policy_engine); // For the ack.
        assert!(matches!(policy_engine.state, State::Ready(..)));
    }
}
