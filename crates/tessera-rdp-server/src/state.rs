//! The frame-emission state machine. Consulted on every frame-timer
//! tick, backend sync reply, suppress/enable output, frame ack, and on
//! activation or resize.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    WaitingBackend,
    WaitingTimer,
    WaitingSyncReply,
    WaitingActiveOutput,
    WaitingFrameSent,
    WaitingAck,
    EventloopMove,
    /// Reported while a resize is pending; never stored.
    WaitingResize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    BackendAttached,
    BackendSyncReplyReceived,
    BackendSyncRequested,
    BackendRewireOriginal,
    BackendTriggerRewire,
    BackendSwitch,
    FrontendEnableOutput,
    FrontendDisableOutput,
    FrontendFrameAckSend,
    FrontendFrameAckReceived,
    FrontendFrameSent,
    FrontendImmediateRequest,
    FrontendNewShadowing,
    FrontendRewireError,
    FrontendTriggerResize,
    FrontendResized,
    FrontendWaitingGfx,
    FrontendStopWaitingGfx,
    FrontendBandwidthFail,
    FrontendBandwidthGood,
    FrameTimer,
}

#[derive(Debug)]
pub struct FrameStateMachine {
    current: FrameState,
    resize_pending: bool,
    output_suppressed: bool,
    waiting_for_bandwidth: bool,
    waiting_gfx: bool,
    handle_frame: bool,
}

impl Default for FrameStateMachine {
    fn default() -> FrameStateMachine {
        FrameStateMachine::new()
    }
}

impl FrameStateMachine {
    #[must_use]
    pub fn new() -> FrameStateMachine {
        FrameStateMachine {
            current: FrameState::WaitingBackend,
            resize_pending: false,
            output_suppressed: false,
            waiting_for_bandwidth: false,
            waiting_gfx: false,
            handle_frame: false,
        }
    }

    fn set_waiting_sync_reply(&mut self) {
        // A pending resize parks the machine on the timer until the
        // reactivation went through.
        if self.resize_pending && self.current == FrameState::WaitingTimer {
            return;
        }
        self.current = FrameState::WaitingSyncReply;
    }

    pub fn set_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::BackendSyncReplyReceived => {
                if self.output_suppressed || self.waiting_gfx {
                    self.current = FrameState::WaitingActiveOutput;
                } else {
                    self.current = FrameState::WaitingFrameSent;
                }
            }
            FrameEvent::FrontendDisableOutput => {
                self.output_suppressed = true;
            }
            FrameEvent::FrontendEnableOutput => {
                if !self.waiting_gfx && self.current == FrameState::WaitingActiveOutput {
                    self.handle_frame = true;
                    self.current = FrameState::WaitingTimer;
                }
                self.output_suppressed = false;
            }
            FrameEvent::FrontendWaitingGfx => {
                self.waiting_gfx = true;
            }
            FrameEvent::FrontendStopWaitingGfx => {
                if !self.output_suppressed && self.current == FrameState::WaitingActiveOutput {
                    self.handle_frame = true;
                    self.current = FrameState::WaitingTimer;
                }
                self.waiting_gfx = false;
            }
            FrameEvent::FrontendBandwidthFail => {
                self.waiting_for_bandwidth = true;
            }
            FrameEvent::FrontendBandwidthGood => {
                self.waiting_for_bandwidth = false;
            }
            FrameEvent::FrontendFrameAckReceived => {
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::BackendSyncRequested => {
                self.handle_frame = false;
                self.set_waiting_sync_reply();
            }
            FrameEvent::FrontendFrameAckSend => {
                self.current = FrameState::WaitingAck;
            }
            FrameEvent::FrontendFrameSent => {
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::FrontendImmediateRequest => {
                self.handle_frame = true;
                self.set_waiting_sync_reply();
            }
            FrameEvent::BackendTriggerRewire => {
                self.handle_frame = true;
                self.current = FrameState::EventloopMove;
            }
            FrameEvent::FrontendNewShadowing => {
                self.handle_frame = true;
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::BackendRewireOriginal => {
                self.handle_frame = true;
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::FrontendRewireError => {
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::BackendSwitch => {
                self.handle_frame = true;
                self.current = FrameState::WaitingBackend;
            }
            FrameEvent::FrontendTriggerResize => {
                self.resize_pending = true;
            }
            FrameEvent::BackendAttached => {
                self.handle_frame = true;
                self.current = FrameState::WaitingTimer;
            }
            FrameEvent::FrontendResized => {
                self.resize_pending = false;
            }
            FrameEvent::FrameTimer => {
                self.handle_frame = true;
            }
        }
    }

    /// The effective state: a pending resize shadows everything else.
    #[must_use]
    pub fn get(&self) -> FrameState {
        if self.resize_pending {
            return FrameState::WaitingResize;
        }
        self.current
    }

    /// A spy joining a session inherits the target's frame latch.
    pub fn prepare_shadowing(&mut self, source: &FrameStateMachine) {
        self.handle_frame = source.handle_frame;
    }

    /// A frame may be created only from WaitingTimer or WaitingSyncReply
    /// with the latch set and no suppress/resize/bandwidth gate.
    #[must_use]
    pub fn should_create_frame(&self) -> bool {
        matches!(
            self.current,
            FrameState::WaitingTimer | FrameState::WaitingSyncReply
        ) && self.handle_frame
            && !self.resize_pending
            && !self.output_suppressed
            && !self.waiting_for_bandwidth
    }

    #[must_use]
    pub fn output_suppressed(&self) -> bool {
        self.output_suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached() -> FrameStateMachine {
        let mut sm = FrameStateMachine::new();
        sm.set_event(FrameEvent::BackendAttached);
        sm
    }

    #[test]
    fn initial_state_waits_for_backend() {
        let sm = FrameStateMachine::new();
        assert_eq!(sm.get(), FrameState::WaitingBackend);
        assert!(!sm.should_create_frame());
    }

    #[test]
    fn attach_then_timer_allows_frame() {
        let mut sm = attached();
        assert_eq!(sm.get(), FrameState::WaitingTimer);
        assert!(sm.should_create_frame());

        sm.set_event(FrameEvent::BackendSyncRequested);
        assert_eq!(sm.get(), FrameState::WaitingSyncReply);
        // The latch was consumed by the request.
        assert!(!sm.should_create_frame());
        sm.set_event(FrameEvent::FrameTimer);
        assert!(sm.should_create_frame());
    }

    #[test]
    fn sync_reply_goes_to_frame_sent_or_active_output() {
        let mut sm = attached();
        sm.set_event(FrameEvent::BackendSyncRequested);
        sm.set_event(FrameEvent::BackendSyncReplyReceived);
        assert_eq!(sm.get(), FrameState::WaitingFrameSent);

        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendDisableOutput);
        sm.set_event(FrameEvent::BackendSyncRequested);
        sm.set_event(FrameEvent::BackendSyncReplyReceived);
        assert_eq!(sm.get(), FrameState::WaitingActiveOutput);
    }

    #[test]
    fn enable_output_resumes_from_active_output() {
        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendDisableOutput);
        sm.set_event(FrameEvent::BackendSyncRequested);
        sm.set_event(FrameEvent::BackendSyncReplyReceived);
        sm.set_event(FrameEvent::FrontendEnableOutput);
        assert_eq!(sm.get(), FrameState::WaitingTimer);
        assert!(sm.should_create_frame());
    }

    #[test]
    fn enable_output_twice_is_a_noop() {
        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendEnableOutput);
        let first = sm.get();
        sm.set_event(FrameEvent::FrontendEnableOutput);
        assert_eq!(sm.get(), first);

        sm.set_event(FrameEvent::FrontendDisableOutput);
        assert!(sm.output_suppressed());
        sm.set_event(FrameEvent::FrontendDisableOutput);
        assert!(sm.output_suppressed());
    }

    #[test]
    fn frame_ack_window() {
        let mut sm = attached();
        sm.set_event(FrameEvent::BackendSyncRequested);
        sm.set_event(FrameEvent::BackendSyncReplyReceived);
        sm.set_event(FrameEvent::FrontendFrameAckSend);
        assert_eq!(sm.get(), FrameState::WaitingAck);
        assert!(!sm.should_create_frame());
        sm.set_event(FrameEvent::FrontendFrameAckReceived);
        assert_eq!(sm.get(), FrameState::WaitingTimer);
    }

    #[test]
    fn resize_is_reported_not_stored() {
        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendTriggerResize);
        assert_eq!(sm.get(), FrameState::WaitingResize);
        assert!(!sm.should_create_frame());
        sm.set_event(FrameEvent::FrontendResized);
        assert_eq!(sm.get(), FrameState::WaitingTimer);
    }

    #[test]
    fn resize_parks_sync_requests_on_the_timer() {
        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendTriggerResize);
        sm.set_event(FrameEvent::BackendSyncRequested);
        sm.set_event(FrameEvent::FrontendResized);
        // The machine stayed on the timer instead of waiting for a
        // reply that will never match the new geometry.
        assert_eq!(sm.get(), FrameState::WaitingTimer);
    }

    #[test]
    fn bandwidth_gate_blocks_emission() {
        let mut sm = attached();
        sm.set_event(FrameEvent::FrontendBandwidthFail);
        assert!(!sm.should_create_frame());
        sm.set_event(FrameEvent::FrontendBandwidthGood);
        assert!(sm.should_create_frame());
    }

    #[test]
    fn rewire_cycle() {
        let mut sm = attached();
        sm.set_event(FrameEvent::BackendTriggerRewire);
        assert_eq!(sm.get(), FrameState::EventloopMove);
        sm.set_event(FrameEvent::BackendRewireOriginal);
        assert_eq!(sm.get(), FrameState::WaitingTimer);
        assert!(sm.should_create_frame());
    }

    #[test]
    fn shadowing_inherits_frame_latch() {
        let mut target = attached();
        target.set_event(FrameEvent::FrameTimer);
        let mut spy = FrameStateMachine::new();
        spy.prepare_shadowing(&target);
        spy.set_event(FrameEvent::FrontendNewShadowing);
        assert!(spy.should_create_frame());
    }
}
