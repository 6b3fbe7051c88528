/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The timeout ticker: a single logical timer that feeds timeouts into the consensus engine's input
//! queue.
//!
//! At most one timeout is pending at any time. Scheduling a timeout replaces the pending one only if its
//! `(height, round, step)` is strictly greater than that of the last timeout scheduled; otherwise the
//! request is ignored. When the pending timeout fires, it is sent into the engine's queue as a
//! [ConsensusInput::Timeout].

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::service::{Service, ServiceError};

use super::messages::{ConsensusInput, TimeoutInfo};
use super::round_state::HRS;

/// Anything the engine can hand timeouts to. Implemented by [TimeoutTicker], and by test schedulers
/// that fire timeouts manually.
pub trait TimeoutScheduler: Service + Send {
    fn schedule_timeout(&mut self, timeout_info: TimeoutInfo);
}

enum TickerCommand {
    Schedule(TimeoutInfo),
    Stop,
}

pub struct TimeoutTicker {
    commands: Sender<TickerCommand>,
    // Taken by the ticker thread on start.
    command_receiver: Option<Receiver<TickerCommand>>,
    tock_sender: SyncSender<ConsensusInput>,
    ticker_thread: Option<JoinHandle<()>>,
}

impl TimeoutTicker {
    /// Create a ticker that sends the timeouts it fires to `tock_sender`. Timeouts may be scheduled
    /// before the ticker is started, but only fire once it is.
    pub fn new(tock_sender: SyncSender<ConsensusInput>) -> TimeoutTicker {
        let (commands, command_receiver) = mpsc::channel();
        TimeoutTicker {
            commands,
            command_receiver: Some(command_receiver),
            tock_sender,
            ticker_thread: None,
        }
    }
}

impl TimeoutScheduler for TimeoutTicker {
    fn schedule_timeout(&mut self, timeout_info: TimeoutInfo) {
        if self
            .commands
            .send(TickerCommand::Schedule(timeout_info))
            .is_err()
        {
            log::debug!("Timeout dropped: ticker stopped");
        }
    }
}

impl Service for TimeoutTicker {
    fn start(&mut self) -> Result<(), ServiceError> {
        let command_receiver = self
            .command_receiver
            .take()
            .ok_or(ServiceError::AlreadyStarted)?;
        let tock_sender = self.tock_sender.clone();
        self.ticker_thread = Some(thread::spawn(move || {
            run_ticker(command_receiver, tock_sender)
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        let ticker_thread = self.ticker_thread.take().ok_or(ServiceError::NotStarted)?;
        if self.commands.send(TickerCommand::Stop).is_err() {
            log::debug!("Ticker thread already exited");
        }
        ticker_thread
            .join()
            .map_err(|_| ServiceError::Failed(String::from("ticker thread panicked")))
    }

    fn wait(&mut self) {
        if let Some(ticker_thread) = self.ticker_thread.take() {
            let _ = ticker_thread.join();
        }
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        if self.ticker_thread.is_some() {
            let _ = self.stop();
        }
    }
}

fn hrs(timeout_info: &TimeoutInfo) -> HRS {
    HRS::new(timeout_info.height, timeout_info.round, timeout_info.step)
}

fn run_ticker(commands: Receiver<TickerCommand>, tock_sender: SyncSender<ConsensusInput>) {
    // The last timeout scheduled, kept after it fires so that stale requests keep being ignored.
    let mut last: Option<TimeoutInfo> = None;
    let mut deadline: Option<Instant> = None;
    // Schedules received while waiting to deliver a fired timeout.
    let mut deferred: VecDeque<TimeoutInfo> = VecDeque::new();

    loop {
        let command = if let Some(timeout_info) = deferred.pop_front() {
            Ok(TickerCommand::Schedule(timeout_info))
        } else {
            match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if at <= now {
                        Err(RecvTimeoutError::Timeout)
                    } else {
                        commands.recv_timeout(at - now)
                    }
                }
                None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            }
        };

        match command {
            Ok(TickerCommand::Schedule(timeout_info)) => {
                if let Some(last) = &last {
                    if hrs(&timeout_info) <= hrs(last) {
                        log::trace!(
                            "Ignoring timeout for {}: not after {}",
                            hrs(&timeout_info),
                            hrs(last)
                        );
                        continue;
                    }
                }
                log::trace!(
                    "Scheduled timeout {}ms for {}",
                    timeout_info.duration_ms,
                    hrs(&timeout_info)
                );
                deadline = Some(Instant::now() + Duration::from_millis(timeout_info.duration_ms));
                last = Some(timeout_info);
            }
            Ok(TickerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                if let Some(timeout_info) = &last {
                    log::debug!("Timed out at {}", hrs(timeout_info));
                    if !send_tock(&tock_sender, &commands, timeout_info.clone(), &mut deferred) {
                        return;
                    }
                }
            }
        }
    }
}

/// Send a fired timeout to the engine, waiting while its queue is full. Returns false if the ticker
/// should exit instead. Schedules that arrive while waiting are pushed onto `deferred`.
fn send_tock(
    tock_sender: &SyncSender<ConsensusInput>,
    commands: &Receiver<TickerCommand>,
    timeout_info: TimeoutInfo,
    deferred: &mut VecDeque<TimeoutInfo>,
) -> bool {
    let mut tock = ConsensusInput::Timeout(timeout_info);
    loop {
        match tock_sender.try_send(tock) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(returned)) => tock = returned,
        }
        match commands.recv_timeout(Duration::from_millis(10)) {
            Ok(TickerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => return false,
            Ok(TickerCommand::Schedule(timeout_info)) => deferred.push_back(timeout_info),
            Err(RecvTimeoutError::Timeout) => (),
        }
    }
}
