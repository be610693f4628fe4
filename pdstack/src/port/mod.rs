//! The port façade: the device policy manager's scheduling loop.
//!
//! A [`Port`] owns the configuration, the Type-C connection state machine and
//! the PD PHY, and drives the role-appropriate policy engine per connection:
//!
//! - Type-C runs attach detection and owns the CC lines while detached,
//! - on attach, the policy engine takes over and negotiates PD,
//! - detach, error recovery and power role swaps return control here.
//!
//! Commands from the application arrive through the `get_event` futures of
//! the role DPM traits; everything observable flows back through
//! [`EventHandler::handle_event`].
use embassy_futures::select::{Either, select};
use pdstack_traits::{CcDriver, Driver};

use crate::config::{ConfigError, PortConfig};
use crate::events::{AppEvent, CommandResult, EventHandler};
use crate::timers::Timer;
use crate::type_c::{AttachKind, Attachment, MonitorEvent, TypeC, TypeCEvent};
use crate::{PowerRole, sink, source};

/// Why a running connection ended.
enum ConnectionEnd {
    Detached,
    ErrorRecovery,
}

/// A USB PD port over a CC front end and a PD PHY.
pub struct Port<CC: CcDriver, PHY: Driver, TIMER: Timer, DPM> {
    config: PortConfig,
    type_c: TypeC<CC, TIMER>,
    phy: PHY,
    dpm: DPM,
}

impl<CC, PHY, TIMER, DPM> Port<CC, PHY, TIMER, DPM>
where
    CC: CcDriver,
    PHY: Driver,
    TIMER: Timer,
    DPM: sink::device_policy_manager::DevicePolicyManager + source::device_policy_manager::DevicePolicyManager,
{
    /// Create a port from its configuration and hardware.
    ///
    /// Fails when the configuration is unusable for the configured role,
    /// e.g. a source without any enabled source PDO.
    pub fn new(config: PortConfig, cc: CC, phy: PHY, dpm: DPM) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            type_c: TypeC::new(cc),
            phy,
            dpm,
        })
    }

    /// The port configuration.
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Replace the PDO tables, e.g. for a capabilities-changed command.
    ///
    /// Takes effect on the next negotiation; call while detached, or follow
    /// up with a renegotiation command through the DPM.
    pub fn update_config(&mut self, config: PortConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    async fn notify(&mut self, event: AppEvent) {
        EventHandler::handle_event(&mut self.dpm, event).await;
    }

    /// Run the port. Only returns if the port is configured disabled.
    pub async fn run(&mut self) {
        if self.config.port_disabled {
            info!("Port is configured disabled");
            return;
        }

        loop {
            // Attach phase: Type-C owns the CC lines.
            let attachment = loop {
                match self.type_c.next(&self.config).await {
                    TypeCEvent::AttachWaitEntered => self.notify(AppEvent::AttachWait).await,
                    TypeCEvent::ReturnedToUnattached => self.notify(AppEvent::AttachWaitToUnattached).await,
                    TypeCEvent::Attached(attachment) => break attachment,
                }
            };

            self.notify(AppEvent::Attach {
                power_role: attachment.power_role,
            })
            .await;
            self.notify(AppEvent::Connect).await;

            let end = match attachment.kind {
                AttachKind::AudioAccessory | AttachKind::DebugAccessory => {
                    // Accessories carry no PD; hold until the termination is
                    // removed.
                    self.wait_for_detach(&attachment).await
                }
                AttachKind::PortPartner if !self.config.pd_enabled => {
                    // Type-C-only operation.
                    if attachment.power_role == PowerRole::Source {
                        source::device_policy_manager::DevicePolicyManager::enable_source(&mut self.dpm, true).await;
                    }
                    self.wait_for_detach(&attachment).await
                }
                AttachKind::PortPartner => self.run_policy_engines(&attachment).await,
            };

            match end {
                ConnectionEnd::Detached => {
                    if attachment.power_role == PowerRole::Source {
                        source::device_policy_manager::DevicePolicyManager::enable_source(&mut self.dpm, false).await;
                    }
                    self.notify(AppEvent::Disconnect).await;
                }
                ConnectionEnd::ErrorRecovery => {
                    self.notify(AppEvent::ErrorRecovery).await;
                    self.notify(AppEvent::Disconnect).await;
                    self.type_c.start_error_recovery();
                }
            }
        }
    }

    /// Watch for detach without PD operation.
    async fn wait_for_detach(&mut self, attachment: &Attachment) -> ConnectionEnd {
        loop {
            match self.type_c.monitor(attachment, &self.config).await {
                MonitorEvent::Detached => return ConnectionEnd::Detached,
                MonitorEvent::RpDetached => {
                    self.notify(AppEvent::RpDetach).await;
                    return ConnectionEnd::Detached;
                }
                MonitorEvent::RpChanged(level) => {
                    self.notify(AppEvent::RpChange(level)).await;
                }
            }
        }
    }

    /// Run the policy engines of a PD connection, following power role swaps,
    /// until detach or error recovery.
    async fn run_policy_engines(&mut self, attachment: &Attachment) -> ConnectionEnd {
        let mut power_role = attachment.power_role;
        let mut after_swap = false;

        loop {
            let engine_result = match power_role {
                PowerRole::Sink => {
                    sink::device_policy_manager::DevicePolicyManager::enable_sink(&mut self.dpm, true).await;

                    let mut engine: sink::Sink<'_, _, TIMER, _> =
                        sink::Sink::new(&mut self.phy, &mut self.dpm, &self.config);

                    Self::drive_engine(
                        &mut self.type_c,
                        attachment,
                        &self.config,
                        engine.run(),
                    )
                    .await
                    .map(|result| result.map(|_| ()))
                }
                PowerRole::Source => {
                    let mut engine: source::Source<'_, _, TIMER, _> =
                        source::Source::new(&mut self.phy, &mut self.dpm, &self.config);
                    if after_swap {
                        engine.start_after_swap();
                    }

                    Self::drive_engine(
                        &mut self.type_c,
                        attachment,
                        &self.config,
                        engine.run(),
                    )
                    .await
                    .map(|result| result.map(|_| ()))
                }
            };

            match engine_result {
                // Detach or Rp removal won the race against the engine.
                Err(end) => {
                    self.notify(AppEvent::Command(CommandResult::Aborted)).await;
                    return end;
                }
                // A completed power role swap restarts the other engine.
                Ok(Ok(())) => {
                    power_role = power_role.flipped();
                    after_swap = true;
                    self.notify(AppEvent::PrSwapComplete(power_role)).await;
                }
                // The partner is unresponsive beyond the hard reset budget.
                Ok(Err(())) => {
                    if self.config.error_recovery {
                        return ConnectionEnd::ErrorRecovery;
                    } else {
                        return ConnectionEnd::Detached;
                    }
                }
            }
        }
    }

    /// Race a policy engine future against the Type-C detach monitor.
    ///
    /// Returns `Err(end)` when the connection ended, `Ok(Ok(()))` on a role
    /// swap outcome and `Ok(Err(()))` when the engine gave up on the partner.
    async fn drive_engine<F, O, E>(
        type_c: &mut TypeC<CC, TIMER>,
        attachment: &Attachment,
        config: &PortConfig,
        engine: F,
    ) -> Result<Result<O, ()>, ConnectionEnd>
    where
        F: core::future::Future<Output = Result<O, E>>,
    {
        let mut engine = core::pin::pin!(engine);

        loop {
            match select(&mut engine, type_c.monitor(attachment, config)).await {
                Either::First(Ok(outcome)) => return Ok(Ok(outcome)),
                Either::First(Err(_)) => {
                    error!("Policy engine gave up on the partner");
                    return Ok(Err(()));
                }
                Either::Second(MonitorEvent::Detached) => return Err(ConnectionEnd::Detached),
                Either::Second(MonitorEvent::RpDetached) => return Err(ConnectionEnd::Detached),
                Either::Second(MonitorEvent::RpChanged(_level)) => {
                    // Collision avoidance advertisement from the source;
                    // keep the engine running.
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::vec::Vec;

    use pdstack_traits::{CcState, Sop};

    use super::Port;
    use crate::config::{ConfigError, PortConfig, PortRole};
    use crate::counters::{Counter, CounterType};
    use crate::dummy::{DUMMY_CAPABILITIES, DummyCcDriver, DummyDriver, MAX_DATA_MESSAGE_SIZE, YieldTimer};
    use crate::events::{AppEvent, ContractStatus, EventHandler};
    use crate::protocol_layer::message::Message;
    use crate::protocol_layer::message::header::{ControlMessageType, Header, SpecificationRevision};
    use crate::{DataRole, PowerRole, sink, source};

    struct RecordingDpm {
        events: Rc<RefCell<Vec<AppEvent>>>,
    }

    impl RecordingDpm {
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

    impl EventHandler for RecordingDpm {
        async fn handle_event(&mut self, event: AppEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    impl sink::device_policy_manager::DevicePolicyManager for RecordingDpm {}
    impl source::device_policy_manager::DevicePolicyManager for RecordingDpm {}

    fn inject_source_control(phy: &mut DummyDriver<MAX_DATA_MESSAGE_SIZE>, message_type: ControlMessageType, id: u8) {
        let template = Header::new_template(DataRole::Dfp, PowerRole::Source, SpecificationRevision::R3_X);
        let header = Header::new_control(template, Counter::new_from_value(CounterType::MessageId, id), message_type);

        let mut buf = [0u8; MAX_DATA_MESSAGE_SIZE];
        let len = Message::new(header).to_bytes(&mut buf);
        phy.inject_received_data(Sop::Sop, &buf[..len]);
    }

    /// Poll the port's run loop a bounded number of times.
    async fn drive<CC, PHY, DPM>(port: &mut Port<CC, PHY, YieldTimer, DPM>, polls: usize)
    where
        CC: pdstack_traits::CcDriver,
        PHY: pdstack_traits::Driver,
        DPM: sink::device_policy_manager::DevicePolicyManager + source::device_policy_manager::DevicePolicyManager,
    {
        let run = port.run();
        let mut run = core::pin::pin!(run);

        for _ in 0..polls {
            tokio::select! {
                biased;
                _ = &mut run => panic!("the port run loop must not return"),
                _ = tokio::task::yield_now() => {}
            }
        }
    }

    #[test]
    fn construction_validates_the_configuration() {
        let mut config = PortConfig::default();
        config.port_role = PortRole::Source;
        config.default_role = PortRole::Source;
        // No source PDOs: a source-capable port must refuse to start.

        let (dpm, _) = RecordingDpm::new();
        let result: Result<Port<_, _, YieldTimer, _>, _> =
            Port::new(config, DummyCcDriver::new(), DummyDriver::<MAX_DATA_MESSAGE_SIZE>::new(), dpm);

        assert!(matches!(result, Err(ConfigError::NoSourcePdos)));
    }

    #[tokio::test]
    async fn sink_attach_negotiates_a_contract() {
        let config = PortConfig::default();

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Rp3A0, CcState::Open);
        cc.set_vbus(true);

        let mut phy = DummyDriver::<MAX_DATA_MESSAGE_SIZE>::new();
        phy.inject_received_data(Sop::Sop, &DUMMY_CAPABILITIES);
        inject_source_control(&mut phy, ControlMessageType::GoodCRC, 0); // For the Request.
        inject_source_control(&mut phy, ControlMessageType::Accept, 1);
        inject_source_control(&mut phy, ControlMessageType::PsRdy, 2);

        let (dpm, events) = RecordingDpm::new();
        let mut port: Port<_, _, YieldTimer, _> = Port::new(config, cc, phy, dpm).unwrap();

        drive(&mut port, 200).await;

        let events = events.borrow();
        assert!(events.iter().any(|event| matches!(event, AppEvent::AttachWait)));
        assert!(events.iter().any(|event| matches!(
            event,
            AppEvent::Attach {
                power_role: PowerRole::Sink
            }
        )));
        assert!(events.iter().any(|event| matches!(event, AppEvent::Connect)));
        assert!(events.iter().any(|event| matches!(
            event,
            AppEvent::ContractNegotiationComplete {
                status: ContractStatus::Successful,
                ..
            }
        )));
        // The connection is still up.
        assert!(!events.iter().any(|event| matches!(event, AppEvent::Disconnect)));
    }
}
