//! The Type-C connection state machine.
//!
//! Senses and drives the CC lines through a [`CcDriver`]: termination
//! selection, attach/detach debouncing, DRP toggling, Try.SRC/Try.SNK role
//! preference, accessory detection and error recovery.
//!
//! The state machine owns the CC lines while the port is detached; once a
//! partner is attached and PD-connected, the policy engine takes over and
//! only the [`TypeC::monitor`] detach watcher keeps observing the lines.
use embassy_futures::select::{Either, Either3, select, select3};
use pdstack_traits::{CcDriver, CcPull, CcState, Polarity, RpLevel};

use crate::PowerRole;
use crate::config::{PortConfig, PortRole, TryRole};
use crate::timers::{Timer, TimerType};

/// DRP toggle period in milliseconds.
const DRP_PERIOD_MS: u64 = 75;

fn after<TIMER: Timer>(timer_type: TimerType) -> impl core::future::Future<Output = ()> {
    TimerType::get_timer::<TIMER>(timer_type)
}

/// Connection states, after USB Type-C R2.2 [4.5.2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum State {
    Disabled,
    ErrorRecovery,
    UnattachedSrc,
    UnattachedWaitSrc,
    UnattachedSnk,
    AttachWaitSrc,
    AttachWaitSnk,
    TrySrc,
    TryWaitSnk,
    TrySnk,
    TryWaitSrc,
    AttachedSrc,
    AttachedSnk,
    AudioAccessory,
    DebugAccessory,
}

/// What kind of partner an attach produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttachKind {
    /// A port partner on the active CC line.
    PortPartner,
    /// Both CC lines read Ra.
    AudioAccessory,
    /// Both CC lines read Rd.
    DebugAccessory,
}

/// A completed attach.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Attachment {
    /// The power role the port took.
    pub power_role: PowerRole,
    /// Plug orientation.
    pub polarity: Polarity,
    /// Partner kind.
    pub kind: AttachKind,
    /// The partner's Rp advertisement, when attached as sink.
    pub partner_rp: Option<RpLevel>,
}

/// Notable transitions reported while waiting for an attach.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TypeCEvent {
    /// An AttachWait state was entered.
    AttachWaitEntered,
    /// The port fell back from AttachWait to Unattached.
    ReturnedToUnattached,
    /// A partner or accessory attached.
    Attached(Attachment),
}

/// Events reported by the attached-state monitor.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MonitorEvent {
    /// The partner detached.
    Detached,
    /// Rp was removed while VBus is still present (sink, Rp-detach mode).
    RpDetached,
    /// The partner source changed its Rp advertisement, e.g. for
    /// sink-transmit collision avoidance.
    RpChanged(RpLevel),
}

/// The Type-C connection state machine over a CC line driver.
#[derive(Debug)]
pub struct TypeC<CC: CcDriver, TIMER: Timer> {
    cc: CC,
    state: State,
    _timer: core::marker::PhantomData<TIMER>,
}

impl<CC: CcDriver, TIMER: Timer> TypeC<CC, TIMER> {
    /// Create a state machine over the CC driver. It starts disabled.
    pub fn new(cc: CC) -> Self {
        Self {
            cc,
            state: State::Disabled,
            _timer: core::marker::PhantomData,
        }
    }

    /// The current connection state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Enter error recovery; the next [`Self::next`] call holds the CC lines
    /// open for tErrorRecovery before restarting attach detection.
    pub fn start_error_recovery(&mut self) {
        self.state = State::ErrorRecovery;
    }

    /// Present SinkTxNG (1.5 A Rp) to hold off sink-initiated AMSs.
    ///
    /// Only meaningful while attached as a PD 3.x source.
    pub async fn sink_tx_ng(&mut self) {
        self.cc.set_pull(CcPull::Source(RpLevel::Rp1A5)).await;
    }

    /// Present SinkTxOK (3 A Rp), allowing the sink to initiate an AMS.
    pub async fn sink_tx_ok(&mut self) {
        self.cc.set_pull(CcPull::Source(RpLevel::Rp3A0)).await;
    }

    fn initial_unattached(config: &PortConfig) -> State {
        match (config.port_role, config.default_role) {
            (PortRole::Source, _) | (PortRole::DualRole, PortRole::Source) => State::UnattachedSrc,
            _ => State::UnattachedSnk,
        }
    }

    /// Wait until both CC lines satisfy `condition` for the full debounce
    /// window. Returns `false` as soon as the condition breaks.
    async fn debounce<F>(&mut self, condition: F, timer: TimerType) -> bool
    where
        F: Fn(CcState, CcState) -> bool,
    {
        let (cc1, cc2) = self.cc.cc_state().await;
        if !condition(cc1, cc2) {
            return false;
        }

        let timeout = after::<TIMER>(timer);
        let broken = async {
            loop {
                self.cc.wait_for_cc_change().await;
                let (cc1, cc2) = self.cc.cc_state().await;
                if !condition(cc1, cc2) {
                    return;
                }
            }
        };

        match select(timeout, broken).await {
            Either::First(_) => true,
            Either::Second(_) => false,
        }
    }

    /// Wait until `condition` holds on the CC lines, with an optional timeout.
    ///
    /// Returns `true` when the condition was met, `false` on timeout.
    async fn wait_for_cc<F>(&mut self, condition: F, timeout: Option<TimerType>) -> bool
    where
        F: Fn(CcState, CcState) -> bool,
    {
        let (cc1, cc2) = self.cc.cc_state().await;
        if condition(cc1, cc2) {
            return true;
        }

        let watch = async {
            loop {
                self.cc.wait_for_cc_change().await;
                let (cc1, cc2) = self.cc.cc_state().await;
                if condition(cc1, cc2) {
                    return;
                }
            }
        };

        match timeout {
            None => {
                watch.await;
                true
            }
            Some(timer) => matches!(
                select(after::<TIMER>(timer), watch).await,
                Either::Second(_)
            ),
        }
    }

    fn sink_polarity(cc1: CcState, cc2: CcState) -> (Polarity, Option<RpLevel>) {
        let level = |state: CcState| match state {
            CcState::RpDefault => Some(RpLevel::Default),
            CcState::Rp1A5 => Some(RpLevel::Rp1A5),
            CcState::Rp3A0 => Some(RpLevel::Rp3A0),
            _ => None,
        };

        if cc1.is_rp() {
            (Polarity::Cc1, level(cc1))
        } else {
            (Polarity::Cc2, level(cc2))
        }
    }

    /// Advance the connection state machine until the next notable event.
    ///
    /// Drives attach detection, DRP toggling and Try.SRC/Try.SNK; resolves
    /// once a partner attaches or a state worth reporting is passed.
    pub async fn next(&mut self, config: &PortConfig) -> TypeCEvent {
        if self.state == State::Disabled {
            self.state = Self::initial_unattached(config);
        }

        loop {
            trace!("Type-C state: {:?}", self.state);

            match self.state {
                State::Disabled => {
                    self.cc.set_pull(CcPull::Open).await;
                    core::future::pending::<()>().await;
                }
                State::ErrorRecovery => {
                    // CC lines open for tErrorRecovery, then restart.
                    self.cc.set_pull(CcPull::Open).await;
                    after::<TIMER>(TimerType::ErrorRecovery).await;
                    self.state = Self::initial_unattached(config);
                    return TypeCEvent::ReturnedToUnattached;
                }
                State::UnattachedSrc => {
                    self.cc.set_pull(CcPull::Source(config.rp_level)).await;

                    let partner_present = |cc1: CcState, cc2: CcState| {
                        cc1.is_rd() || cc2.is_rd() || (cc1 == CcState::Ra && cc2 == CcState::Ra)
                    };

                    let toggle = config.drp_toggle && config.port_role == PortRole::DualRole;
                    let timeout_ms = DRP_PERIOD_MS * config.drp_source_duty() as u64 / 100;

                    let (cc1, cc2) = self.cc.cc_state().await;
                    let attached = if partner_present(cc1, cc2) {
                        true
                    } else if toggle {
                        let watch = self.wait_for_cc(partner_present, None);
                        match select(TIMER::after_millis(timeout_ms), watch).await {
                            Either::First(_) => false,
                            Either::Second(_) => true,
                        }
                    } else {
                        self.wait_for_cc(partner_present, None).await
                    };

                    if attached {
                        self.state = State::AttachWaitSrc;
                        return TypeCEvent::AttachWaitEntered;
                    } else {
                        self.state = State::UnattachedSnk;
                    }
                }
                State::UnattachedWaitSrc => {
                    // Drive VConn/VBus discharge complete; fall back to source.
                    after::<TIMER>(TimerType::VCONNDischarge).await;
                    self.state = State::UnattachedSrc;
                }
                State::UnattachedSnk => {
                    self.cc.set_pull(CcPull::Sink).await;

                    let source_present = |cc1: CcState, cc2: CcState| cc1.is_rp() || cc2.is_rp();

                    let toggle = config.drp_toggle && config.port_role == PortRole::DualRole;
                    let timeout_ms = DRP_PERIOD_MS * (100 - config.drp_source_duty()) as u64 / 100;

                    let (cc1, cc2) = self.cc.cc_state().await;
                    let attached = if source_present(cc1, cc2) {
                        true
                    } else if toggle {
                        let watch = self.wait_for_cc(source_present, None);
                        match select(TIMER::after_millis(timeout_ms), watch).await {
                            Either::First(_) => false,
                            Either::Second(_) => true,
                        }
                    } else {
                        self.wait_for_cc(source_present, None).await
                    };

                    if attached {
                        self.state = State::AttachWaitSnk;
                        return TypeCEvent::AttachWaitEntered;
                    } else {
                        self.state = State::UnattachedSrc;
                    }
                }
                State::AttachWaitSrc => {
                    let partner_present = |cc1: CcState, cc2: CcState| {
                        cc1.is_rd() || cc2.is_rd() || (cc1 == CcState::Ra && cc2 == CcState::Ra)
                    };

                    if !self.debounce(partner_present, TimerType::CCDebounce).await {
                        self.state = State::UnattachedSrc;
                        return TypeCEvent::ReturnedToUnattached;
                    }

                    // Re-verify before committing.
                    if !self.debounce(partner_present, TimerType::PDDebounce).await {
                        self.state = State::UnattachedSrc;
                        return TypeCEvent::ReturnedToUnattached;
                    }

                    let (cc1, cc2) = self.cc.cc_state().await;
                    self.state = match (cc1, cc2) {
                        (CcState::Rd, CcState::Rd) if config.accessory => State::DebugAccessory,
                        (CcState::Ra, CcState::Ra) if config.accessory => State::AudioAccessory,
                        (CcState::Ra, CcState::Ra) => {
                            // Accessories disabled; nothing to attach to.
                            State::UnattachedSrc
                        }
                        _ if config.try_role == TryRole::TrySnk => State::TrySnk,
                        _ => State::AttachedSrc,
                    };
                }
                State::AttachWaitSnk => {
                    let source_present = |cc1: CcState, cc2: CcState| cc1.is_rp() || cc2.is_rp();

                    if !self.debounce(source_present, TimerType::CCDebounce).await {
                        self.state = State::UnattachedSnk;
                        return TypeCEvent::ReturnedToUnattached;
                    }

                    // A sink shall not attach before VBus is present.
                    if !self.cc.vbus_present().await {
                        self.cc.wait_for_vbus_change().await;
                        if !self.cc.vbus_present().await {
                            self.state = State::UnattachedSnk;
                            return TypeCEvent::ReturnedToUnattached;
                        }
                    }

                    if !self.debounce(source_present, TimerType::PDDebounce).await {
                        self.state = State::UnattachedSnk;
                        return TypeCEvent::ReturnedToUnattached;
                    }

                    self.state = match config.try_role {
                        TryRole::TrySrc => State::TrySrc,
                        _ => State::AttachedSnk,
                    };
                }
                State::TrySrc => {
                    // Prefer sourcing: present Rp and look for Rd.
                    self.cc.set_pull(CcPull::Source(config.rp_level)).await;

                    // Hold the new role for at least tDRPTry before sampling.
                    after::<TIMER>(TimerType::DRPTry).await;

                    let partner_is_sink = |cc1: CcState, cc2: CcState| cc1.is_rd() || cc2.is_rd();

                    if self.wait_for_cc(partner_is_sink, Some(TimerType::TryTimeout)).await
                        && self.debounce(partner_is_sink, TimerType::PDDebounce).await
                    {
                        self.state = State::AttachedSrc;
                    } else {
                        self.state = State::TryWaitSnk;
                    }
                }
                State::TryWaitSnk => {
                    self.cc.set_pull(CcPull::Sink).await;

                    let source_present = |cc1: CcState, cc2: CcState| cc1.is_rp() || cc2.is_rp();

                    // The original source re-presents Rp after the try bounce.
                    if self.wait_for_cc(source_present, Some(TimerType::TryTimeout)).await
                        && self.debounce(source_present, TimerType::PDDebounce).await
                    {
                        self.state = State::AttachedSnk;
                    } else {
                        self.state = State::UnattachedSnk;
                        return TypeCEvent::ReturnedToUnattached;
                    }
                }
                State::TrySnk => {
                    // Prefer sinking: present Rd and wait for the partner's Rp.
                    self.cc.set_pull(CcPull::Sink).await;

                    after::<TIMER>(TimerType::DRPTry).await;

                    let source_present = |cc1: CcState, cc2: CcState| cc1.is_rp() || cc2.is_rp();

                    if self.wait_for_cc(source_present, Some(TimerType::TryTimeout)).await
                        && self.debounce(source_present, TimerType::PDDebounce).await
                        && self.cc.vbus_present().await
                    {
                        self.state = State::AttachedSnk;
                    } else {
                        self.state = State::TryWaitSrc;
                    }
                }
                State::TryWaitSrc => {
                    self.cc.set_pull(CcPull::Source(config.rp_level)).await;

                    let partner_is_sink = |cc1: CcState, cc2: CcState| cc1.is_rd() || cc2.is_rd();

                    if self.wait_for_cc(partner_is_sink, Some(TimerType::DRPTry)).await
                        && self.debounce(partner_is_sink, TimerType::PDDebounce).await
                    {
                        self.state = State::AttachedSrc;
                    } else {
                        self.state = State::UnattachedSnk;
                        return TypeCEvent::ReturnedToUnattached;
                    }
                }
                State::AttachedSrc => {
                    let (cc1, cc2) = self.cc.cc_state().await;
                    let polarity = if cc1.is_rd() { Polarity::Cc1 } else { Polarity::Cc2 };

                    return TypeCEvent::Attached(Attachment {
                        power_role: PowerRole::Source,
                        polarity,
                        kind: AttachKind::PortPartner,
                        partner_rp: None,
                    });
                }
                State::AttachedSnk => {
                    let (cc1, cc2) = self.cc.cc_state().await;
                    let (polarity, partner_rp) = Self::sink_polarity(cc1, cc2);

                    return TypeCEvent::Attached(Attachment {
                        power_role: PowerRole::Sink,
                        polarity,
                        kind: AttachKind::PortPartner,
                        partner_rp,
                    });
                }
                State::AudioAccessory => {
                    return TypeCEvent::Attached(Attachment {
                        power_role: PowerRole::Source,
                        polarity: Polarity::Cc1,
                        kind: AttachKind::AudioAccessory,
                        partner_rp: None,
                    });
                }
                State::DebugAccessory => {
                    return TypeCEvent::Attached(Attachment {
                        power_role: PowerRole::Source,
                        polarity: Polarity::Cc1,
                        kind: AttachKind::DebugAccessory,
                        partner_rp: None,
                    });
                }
            }
        }
    }

    /// Watch an attached connection for detach and Rp changes.
    ///
    /// Resolves with the observed event; on [`MonitorEvent::Detached`] the
    /// state machine has already returned to the unattached state.
    pub async fn monitor(&mut self, attachment: &Attachment, config: &PortConfig) -> MonitorEvent {
        match attachment.power_role {
            PowerRole::Source => loop {
                // Accessory states persist until the termination disappears.
                let partner_present: fn(CcState, CcState) -> bool = match attachment.kind {
                    AttachKind::AudioAccessory => |cc1, cc2| cc1 == CcState::Ra && cc2 == CcState::Ra,
                    AttachKind::DebugAccessory => |cc1, cc2| cc1.is_rd() && cc2.is_rd(),
                    AttachKind::PortPartner => |cc1, cc2| cc1.is_rd() || cc2.is_rd(),
                };

                self.cc.wait_for_cc_change().await;

                let gone = |cc1: CcState, cc2: CcState| !partner_present(cc1, cc2);
                let (cc1, cc2) = self.cc.cc_state().await;
                if gone(cc1, cc2) && self.debounce(gone, TimerType::SourceDisconnect).await {
                    // VConn discharges in UnattachedWait.SRC before the port
                    // presents terminations again.
                    self.state = State::UnattachedWaitSrc;
                    return MonitorEvent::Detached;
                }
            },
            PowerRole::Sink => {
                let mut last_rp = attachment.partner_rp;

                loop {
                    let changed = select3(
                        self.cc.wait_for_vbus_change(),
                        self.cc.wait_for_cc_change(),
                        core::future::pending::<()>(),
                    )
                    .await;

                    match changed {
                        Either3::First(_) => {
                            if !self.cc.vbus_present().await {
                                self.state = State::UnattachedSnk;
                                return MonitorEvent::Detached;
                            }
                        }
                        _ => {
                            let (cc1, cc2) = self.cc.cc_state().await;
                            let (_, rp) = Self::sink_polarity(cc1, cc2);

                            match rp {
                                Some(level) if last_rp != Some(level) => {
                                    last_rp = Some(level);
                                    return MonitorEvent::RpChanged(level);
                                }
                                Some(_) => {}
                                None if config.rp_detach => {
                                    let rp_gone =
                                        |cc1: CcState, cc2: CcState| !cc1.is_rp() && !cc2.is_rp();
                                    if self.debounce(rp_gone, TimerType::PDDebounce).await {
                                        return MonitorEvent::RpDetached;
                                    }
                                }
                                None => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::{DummyCcDriver, DummyTimer, InstantTimer};

    fn drp_config() -> PortConfig {
        let mut config = PortConfig::default();
        config.port_role = PortRole::DualRole;
        config.default_role = PortRole::Source;
        config.drp_toggle = true;
        config.rp_level = RpLevel::Rp3A0;
        config
    }

    #[tokio::test]
    async fn sink_attach_after_debounce() {
        let mut config = PortConfig::default();
        config.port_role = PortRole::Sink;

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Rp3A0, CcState::Open);
        cc.set_vbus(true);

        // Timers resolve immediately, so the debounce windows pass with the
        // stable line state.
        let mut type_c: TypeC<_, InstantTimer> = TypeC::new(&mut cc);

        let event = type_c.next(&config).await;
        assert!(matches!(event, TypeCEvent::AttachWaitEntered));
        assert_eq!(type_c.state(), State::AttachWaitSnk);

        let event = type_c.next(&config).await;
        let TypeCEvent::Attached(attachment) = event else {
            panic!("expected attach, got {:?}", event);
        };
        assert_eq!(attachment.power_role, PowerRole::Sink);
        assert_eq!(attachment.polarity, Polarity::Cc1);
        assert_eq!(attachment.partner_rp, Some(RpLevel::Rp3A0));
    }

    #[tokio::test]
    async fn source_attach_on_cc2_sets_polarity() {
        let mut config = PortConfig::default();
        config.port_role = PortRole::Source;
        config.default_role = PortRole::Source;
        // A single source PDO, to pass validation paths that need one.
        config.src_pdos.push(0x0A01_912C).ok();
        config.src_pdo_mask = 0x01;

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Open, CcState::Rd);

        {
            let mut type_c: TypeC<_, InstantTimer> = TypeC::new(&mut cc);

            assert!(matches!(type_c.next(&config).await, TypeCEvent::AttachWaitEntered));
            let TypeCEvent::Attached(attachment) = type_c.next(&config).await else {
                panic!("expected attach");
            };
            assert_eq!(attachment.power_role, PowerRole::Source);
            assert_eq!(attachment.polarity, Polarity::Cc2);
        }

        // The state machine presented the configured Rp the whole time.
        assert_eq!(cc.applied_pulls().last(), Some(&CcPull::Source(RpLevel::Default)));
    }

    #[tokio::test]
    async fn debug_accessory_on_both_rd() {
        let mut config = PortConfig::default();
        config.port_role = PortRole::Source;
        config.default_role = PortRole::Source;
        config.accessory = true;

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Rd, CcState::Rd);

        let mut type_c: TypeC<_, InstantTimer> = TypeC::new(&mut cc);

        assert!(matches!(type_c.next(&config).await, TypeCEvent::AttachWaitEntered));
        let TypeCEvent::Attached(attachment) = type_c.next(&config).await else {
            panic!("expected attach");
        };
        assert_eq!(attachment.kind, AttachKind::DebugAccessory);
    }

    #[tokio::test]
    async fn try_src_falls_through_to_try_wait_snk() {
        // Try.SRC configured, but the partner never presents Rd: after the
        // try timeout the port falls back to sinking from the original source.
        let mut config = drp_config();
        config.try_role = TryRole::TrySrc;
        config.port_role = PortRole::DualRole;
        config.default_role = PortRole::Sink;

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Rp1A5, CcState::Open);
        cc.set_vbus(true);

        let mut type_c: TypeC<_, InstantTimer> = TypeC::new(&mut cc);

        assert!(matches!(type_c.next(&config).await, TypeCEvent::AttachWaitEntered));
        // AttachWait.SNK debounces, then Try.SRC runs; with the partner still
        // presenting Rp (never Rd), the port ends up attached as sink via
        // TryWait.SNK.
        let TypeCEvent::Attached(attachment) = type_c.next(&config).await else {
            panic!("expected attach");
        };
        assert_eq!(attachment.power_role, PowerRole::Sink);
    }

    #[tokio::test]
    async fn error_recovery_reopens_cc() {
        let config = drp_config();

        let mut cc = DummyCcDriver::new();
        cc.set_line_state(CcState::Open, CcState::Open);

        let mut type_c: TypeC<_, DummyTimer> = TypeC::new(&mut cc);
        type_c.start_error_recovery();
        assert_eq!(type_c.state(), State::ErrorRecovery);

        // DummyTimer never fires, so error recovery holds; the state machine
        // must not report an attach.
        let next = type_c.next(&config);
        tokio::select! {
            biased;
            _ = next => panic!("error recovery must hold the port"),
            _ = tokio::task::yield_now() => {}
        }
    }
}
