//! Tests for the source policy engine.

use std::cell::RefCell;
use std::rc::Rc;
use std::vec::Vec;

use super::{Source, State};
use crate::config::{PortConfig, PortRole};
use crate::counters::{Counter, CounterType};
use crate::dummy::{DummyDriver, DummySourceDevice, DummyTimer, InstantTimer, MAX_DATA_MESSAGE_SIZE};
use crate::events::{AppEvent, EventHandler};
use crate::protocol_layer::message::data::Data;
use crate::protocol_layer::message::data::epr_mode::{Action, DataEnterFailed};
use crate::protocol_layer::message::data::request::{EprRequest, FixedVariableSupply, PowerSource};
use crate::protocol_layer::message::data::source_capabilities::{FixedSupply, PowerDataObject};
use crate::protocol_layer::message::header::{
    ControlMessageType, DataMessageType, Header, MessageType, SpecificationRevision,
};
use crate::protocol_layer::message::{Message, Payload};
use crate::source::device_policy_manager::DevicePolicyManager;
use crate::{DataRole, PowerRole};
use pdstack_traits::Sop;

/// Records every event the engine raises.
struct RecordingSourceDevice {
    events: Rc<RefCell<Vec<AppEvent>>>,
}

impl RecordingSourceDevice {
    fn new() -> (Self, Rc<RefCell<Vec<AppEvent>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl EventHandler for RecordingSourceDevice {
    async fn handle_event(&mut self, event: AppEvent) {
        self.events.borrow_mut().push(event);
    }
}

impl DevicePolicyManager for RecordingSourceDevice {}

fn source_config() -> PortConfig {
    let mut config = PortConfig::default();
    config.port_role = PortRole::Source;
    config.default_role = PortRole::Source;
    config.src_pdos.clear();
    config.src_pdos.push(0x0A01_912C).ok(); // 5 V, 3 A
    config.src_pdos.push(0x0002_D12C).ok(); // 9 V, 3 A
    config.src_pdo_mask = 0x03;
    config
}

fn sink_header_template() -> Header {
    Header::new_template(DataRole::Ufp, PowerRole::Sink, SpecificationRevision::R3_X)
}

type TestSource<'a, DPM> = Source<'a, DummyDriver<MAX_DATA_MESSAGE_SIZE>, DummyTimer, DPM>;

fn simulate_sink_control_message<DPM: DevicePolicyManager>(
    policy_engine: &mut TestSource<DPM>,
    control_message_type: ControlMessageType,
    message_id: u8,
) {
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = Message::new(Header::new_control(
        sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        control_message_type,
    ))
    .to_bytes(&mut buf);

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);
}

fn simulate_sink_request<DPM: DevicePolicyManager>(
    policy_engine: &mut TestSource<DPM>,
    object_position: u8,
    current_10ma: u16,
    message_id: u8,
) {
    let rdo = FixedVariableSupply(0)
        .with_object_position(object_position)
        .with_raw_operating_current(current_10ma)
        .with_raw_max_operating_current(current_10ma)
        .with_no_usb_suspend(true);

    let header = Header::new_data(
        sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, message_id),
        DataMessageType::Request,
        1,
    );

    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let mut len = header.to_bytes(&mut buf);
    len += rdo.to_bytes(&mut buf[len..]);

    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);
}

#[tokio::test]
async fn test_source_negotiation() {
    let config = source_config();
    let mut device = DummySourceDevice {};

    let mut policy_engine: TestSource<_> = Source::new(DummyDriver::new(), &mut device, &config);

    // Startup -> SendCapabilities (cable discovery is disabled).
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::SendCapabilities));

    // The sink acknowledges the capabilities and requests 9 V at 3 A.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_sink_request(&mut policy_engine, 2, 300, 0);

    // SendCapabilities -> NegotiateCapability
    policy_engine.run_step().await.unwrap();

    let (_, caps) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        caps.header.message_type(),
        MessageType::Data(DataMessageType::SourceCapabilities)
    ));
    assert_eq!(caps.header.num_objects(), 2);
    let Some(Payload::Data(Data::SourceCapabilities(advertised))) = caps.payload else {
        panic!("expected source capabilities payload");
    };
    let PowerDataObject::FixedSupply(vsafe5v) = advertised.pdos()[0] else {
        panic!("expected a fixed vSafe5V PDO");
    };
    assert_eq!(vsafe5v.raw_voltage(), 100);

    let (_, good_crc) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));

    // GoodCRC for the Accept, then for PS_RDY.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // NegotiateCapability -> TransitionSupply
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::TransitionSupply(_)));

    let (_, accept) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        accept.header.message_type(),
        MessageType::Control(ControlMessageType::Accept)
    ));

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);

    // TransitionSupply -> Ready
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    let (_, ps_rdy) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        ps_rdy.header.message_type(),
        MessageType::Control(ControlMessageType::PsRdy)
    ));
    assert!(policy_engine.contract.is_some());
}

#[tokio::test]
async fn test_request_beyond_advertised_positions_is_rejected() {
    let config = source_config();
    let mut device = DummySourceDevice {};

    let mut policy_engine: TestSource<_> = Source::new(DummyDriver::new(), &mut device, &config);

    policy_engine.run_step().await.unwrap();

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    // Object position 5 does not exist in the two advertised PDOs.
    simulate_sink_request(&mut policy_engine, 5, 300, 0);
    policy_engine.run_step().await.unwrap();

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);

    // NegotiateCapability -> Reject, and no contract existed before.
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::WaitNewCapabilities));

    // Skip the capabilities and their GoodCRC.
    policy_engine.protocol_layer.driver().probe_transmitted_data();
    policy_engine.protocol_layer.driver().probe_transmitted_data();

    let (_, reject) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        reject.header.message_type(),
        MessageType::Control(ControlMessageType::Reject)
    ));
}

#[tokio::test]
async fn test_epr_request_with_mismatched_pdo_mirror_hard_resets() {
    let config = source_config();
    let mut device = DummySourceDevice {};

    let mut policy_engine: TestSource<_> = Source::new(DummyDriver::new(), &mut device, &config);

    // A forged EPR request: valid object position, but the PDO copy does not
    // mirror the advertised 5 V supply.
    let forged = PowerSource::EprRequest(EprRequest {
        rdo: FixedVariableSupply(0)
            .with_object_position(1)
            .with_raw_operating_current(300)
            .with_raw_max_operating_current(300)
            .0,
        pdo: PowerDataObject::FixedSupply(FixedSupply::default().with_raw_voltage(960).with_raw_max_current(500)),
    });

    policy_engine.state = State::NegotiateCapability(forged);
    policy_engine.run_step().await.unwrap();

    // Per spec 6.4.11: hard reset, not reject.
    assert!(matches!(policy_engine.state, State::HardReset));
}

#[tokio::test]
async fn test_source_caps_retry_exhaustion_falls_back_to_non_pd() {
    let config = source_config();
    let (mut device, events) = RecordingSourceDevice::new();

    // The partner never acknowledges: every GoodCRC window times out
    // immediately with the instant timer, exhausting the retry counter.
    let mut policy_engine: Source<DummyDriver<MAX_DATA_MESSAGE_SIZE>, InstantTimer, _> =
        Source::new(DummyDriver::new(), &mut device, &config);

    // Startup, then alternating SendCapabilities/Discovery attempts.
    policy_engine.run_step().await.unwrap();
    for _ in 0..11 {
        if matches!(policy_engine.state, State::NonPd) {
            break;
        }
        policy_engine.run_step().await.unwrap();
    }

    assert!(matches!(policy_engine.state, State::NonPd));
    assert!(
        events
            .borrow()
            .iter()
            .any(|event| matches!(event, AppEvent::SourceCapsTriedWithNoResponse))
    );

    // Each attempt transmitted nRetryCount + 1 frames.
    let mut frames = 0;
    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
        frames += 1;
    }
    assert_eq!(frames, 6 * 3);
}

#[tokio::test]
async fn test_epr_entry_without_epr_cable_fails_with_cause() {
    let mut config = source_config();
    config.epr_src_pdos.push(0x0003_05F4).ok(); // 28 V EPR PDO configured.
    config.epr_src_pdo_mask = 0x01;

    let (mut device, events) = RecordingSourceDevice::new();
    let mut policy_engine: TestSource<_> = Source::new(DummyDriver::new(), &mut device, &config);

    // An explicit contract whose RDO announced EPR capability, but no cable
    // identity was discovered: entry must fail with the cable cause.
    policy_engine.last_rdo_epr_capable = true;
    policy_engine.state = State::EprEvaluateEntry(140);

    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    let (_, response) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    let Some(Payload::Data(Data::EprMode(epr))) = response.payload else {
        panic!("expected an EPR mode payload");
    };
    assert_eq!(epr.action(), Action::EnterFailed);
    assert_eq!(DataEnterFailed::from(epr.data()), DataEnterFailed::CableNotEprCapable);

    assert!(events.borrow().iter().any(|event| matches!(
        event,
        AppEvent::EprModeEntryFailed(DataEnterFailed::CableNotEprCapable)
    )));
}

#[tokio::test]
async fn test_keep_alive_is_acknowledged() {
    let config = source_config();
    let mut device = DummySourceDevice {};

    let mut policy_engine: TestSource<_> = Source::new(DummyDriver::new(), &mut device, &config);

    // Negotiate up to Ready.
    policy_engine.run_step().await.unwrap();
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 0);
    simulate_sink_request(&mut policy_engine, 1, 300, 0);
    policy_engine.run_step().await.unwrap();
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 1);
    policy_engine.run_step().await.unwrap();
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 2);
    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    while policy_engine.protocol_layer.driver().has_transmitted_data() {
        policy_engine.protocol_layer.driver().probe_transmitted_data();
    }

    // The sink's keep-alive arrives as an extended control message.
    let header = Header::new_extended(
        sink_header_template(),
        Counter::new_from_value(CounterType::MessageId, 1),
        crate::protocol_layer::message::header::ExtendedMessageType::ExtendedControl,
        1,
    );
    let message = Message::new_with_extended(
        header,
        crate::protocol_layer::message::extended::Extended::ExtendedControl(
            crate::protocol_layer::message::extended::extended_control::ExtendedControl::default().with_message_type(
                crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType::EprKeepAlive,
            ),
        ),
    );
    let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
    let len = message.to_bytes(&mut buf);
    policy_engine
        .protocol_layer
        .driver()
        .inject_received_data(Sop::Sop, &buf[..len]);

    // GoodCRC for the ack this port transmits.
    simulate_sink_control_message(&mut policy_engine, ControlMessageType::GoodCRC, 3);

    policy_engine.run_step().await.unwrap();
    assert!(matches!(policy_engine.state, State::Ready));

    // GoodCRC for the keep-alive, then the ack itself.
    let (_, good_crc) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    assert!(matches!(
        good_crc.header.message_type(),
        MessageType::Control(ControlMessageType::GoodCRC)
    ));

    let (_, ack) = policy_engine.protocol_layer.driver().probe_transmitted_message();
    let Some(Payload::Extended(crate::protocol_layer::message::extended::Extended::ExtendedControl(control))) =
        ack.payload
    else {
        panic!("expected extended control payload");
    };
    assert_eq!(
        control.message_type(),
        crate::protocol_layer::message::extended::extended_control::ExtendedControlMessageType::EprKeepAliveAck
    );
}
