use crate::events::*;
use crate::logging::Logger;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) new_round_step_handlers: Vec<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) new_round_handlers: Vec<HandlerPtr<NewRoundEvent>>,
    pub(crate) complete_proposal_handlers: Vec<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) new_valid_block_handlers: Vec<HandlerPtr<NewValidBlockEvent>>,
    pub(crate) timeout_propose_handlers: Vec<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) timeout_wait_handlers: Vec<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) polka_handlers: Vec<HandlerPtr<PolkaEvent>>,
    pub(crate) lock_handlers: Vec<HandlerPtr<LockEvent>>,
    pub(crate) unlock_handlers: Vec<HandlerPtr<UnlockEvent>>,
    pub(crate) relock_handlers: Vec<HandlerPtr<RelockEvent>>,
    pub(crate) conflicting_votes_handlers: Vec<HandlerPtr<ConflictingVotesEvent>>,
    pub(crate) new_block_handlers: Vec<HandlerPtr<NewBlockEvent>>,
    pub(crate) new_block_header_handlers: Vec<HandlerPtr<NewBlockHeaderEvent>>,
    pub(crate) validator_set_updates_handlers: Vec<HandlerPtr<ValidatorSetUpdatesEvent>>,
}

/// The user-defined handlers of each event type, any of which may be absent.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) on_new_round: Option<HandlerPtr<NewRoundEvent>>,
    pub(crate) on_complete_proposal: Option<HandlerPtr<CompleteProposalEvent>>,
    pub(crate) on_new_valid_block: Option<HandlerPtr<NewValidBlockEvent>>,
    pub(crate) on_timeout_propose: Option<HandlerPtr<TimeoutProposeEvent>>,
    pub(crate) on_timeout_wait: Option<HandlerPtr<TimeoutWaitEvent>>,
    pub(crate) on_vote: Option<HandlerPtr<VoteEvent>>,
    pub(crate) on_polka: Option<HandlerPtr<PolkaEvent>>,
    pub(crate) on_lock: Option<HandlerPtr<LockEvent>>,
    pub(crate) on_unlock: Option<HandlerPtr<UnlockEvent>>,
    pub(crate) on_relock: Option<HandlerPtr<RelockEvent>>,
    pub(crate) on_conflicting_votes: Option<HandlerPtr<ConflictingVotesEvent>>,
    pub(crate) on_new_block: Option<HandlerPtr<NewBlockEvent>>,
    pub(crate) on_new_block_header: Option<HandlerPtr<NewBlockHeaderEvent>>,
    pub(crate) on_validator_set_updates: Option<HandlerPtr<ValidatorSetUpdatesEvent>>,
}

// Collect the user's handler, followed by the default logger if events are logged.
fn handlers<T: Logger>(user_handler: Option<HandlerPtr<T>>, log_events: bool) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if let Some(handler) = user_handler {
        handlers.push(handler)
    }
    if log_events {
        handlers.push(T::get_logger())
    }
    handlers
}

impl EventHandlers {

    pub(crate) fn new(log_events: bool, user_handlers: UserHandlers) -> EventHandlers {
        EventHandlers {
            new_round_step_handlers: handlers(user_handlers.on_new_round_step, log_events),
            new_round_handlers: handlers(user_handlers.on_new_round, log_events),
            complete_proposal_handlers: handlers(user_handlers.on_complete_proposal, log_events),
            new_valid_block_handlers: handlers(user_handlers.on_new_valid_block, log_events),
            timeout_propose_handlers: handlers(user_handlers.on_timeout_propose, log_events),
            timeout_wait_handlers: handlers(user_handlers.on_timeout_wait, log_events),
            vote_handlers: handlers(user_handlers.on_vote, log_events),
            polka_handlers: handlers(user_handlers.on_polka, log_events),
            lock_handlers: handlers(user_handlers.on_lock, log_events),
            unlock_handlers: handlers(user_handlers.on_unlock, log_events),
            relock_handlers: handlers(user_handlers.on_relock, log_events),
            conflicting_votes_handlers: handlers(user_handlers.on_conflicting_votes, log_events),
            new_block_handlers: handlers(user_handlers.on_new_block, log_events),
            new_block_header_handlers: handlers(user_handlers.on_new_block_header, log_events),
            validator_set_updates_handlers: handlers(user_handlers.on_validator_set_updates, log_events),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.new_round_step_handlers.is_empty()
            && self.new_round_handlers.is_empty()
            && self.complete_proposal_handlers.is_empty()
            && self.new_valid_block_handlers.is_empty()
            && self.timeout_propose_handlers.is_empty()
            && self.timeout_wait_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.polka_handlers.is_empty()
            && self.lock_handlers.is_empty()
            && self.unlock_handlers.is_empty()
            && self.relock_handlers.is_empty()
            && self.conflicting_votes_handlers.is_empty()
            && self.new_block_handlers.is_empty()
            && self.new_block_header_handlers.is_empty()
            && self.validator_set_updates_handlers.is_empty()
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::NewRoundStep(new_round_step_event) =>
                self.new_round_step_handlers.iter().for_each(|handler| handler(&new_round_step_event)),

            Event::NewRound(new_round_event) =>
                self.new_round_handlers.iter().for_each(|handler| handler(&new_round_event)),

            Event::CompleteProposal(complete_proposal_event) =>
                self.complete_proposal_handlers.iter().for_each(|handler| handler(&complete_proposal_event)),

            Event::NewValidBlock(new_valid_block_event) =>
                self.new_valid_block_handlers.iter().for_each(|handler| handler(&new_valid_block_event)),

            Event::TimeoutPropose(timeout_propose_event) =>
                self.timeout_propose_handlers.iter().for_each(|handler| handler(&timeout_propose_event)),

            Event::TimeoutWait(timeout_wait_event) =>
                self.timeout_wait_handlers.iter().for_each(|handler| handler(&timeout_wait_event)),

            Event::Vote(vote_event) =>
                self.vote_handlers.iter().for_each(|handler| handler(&vote_event)),

            Event::Polka(polka_event) =>
                self.polka_handlers.iter().for_each(|handler| handler(&polka_event)),

            Event::Lock(lock_event) =>
                self.lock_handlers.iter().for_each(|handler| handler(&lock_event)),

            Event::Unlock(unlock_event) =>
                self.unlock_handlers.iter().for_each(|handler| handler(&unlock_event)),

            Event::Relock(relock_event) =>
                self.relock_handlers.iter().for_each(|handler| handler(&relock_event)),

            Event::ConflictingVotes(conflicting_votes_event) =>
                self.conflicting_votes_handlers.iter().for_each(|handler| handler(&conflicting_votes_event)),

            Event::NewBlock(new_block_event) =>
                self.new_block_handlers.iter().for_each(|handler| handler(&new_block_event)),

            Event::NewBlockHeader(new_block_header_event) =>
                self.new_block_header_handlers.iter().for_each(|handler| handler(&new_block_header_event)),

            Event::ValidatorSetUpdates(validator_set_updates_event) =>
                self.validator_set_updates_handlers.iter().for_each(|handler| handler(&validator_set_updates_event)),
        }
    }
}


pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone: wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => thread::sleep(Duration::from_millis(50)),
        }
    })
}
