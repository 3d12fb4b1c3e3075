//! Fuzz target for the protocol state machine
//!
//! Interleaves fuzzer-chosen frames from a few connections through their
//! drivers against one shared registry, tearing a connection down the way the
//! transports do once its driver terminates.
//!
//! # Invariants
//!
//! - At most one ERROR per connection, and it is the last frame sent
//! - Nothing is sent to a connection after its final frame
//! - CONNECTED is only ever sent once per connection
//! - Registry subscription counts stay consistent with `is_subscribed`

#![no_main]

use std::sync::{Arc, Mutex};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stompd_proto::{Command, Frame};
use stompd_server::{ConnectionHandle, ConnectionRegistry, NoopAudit, ProtocolDriver};

const USERS: [&str; 2] = ["alice", "bob"];
const PASSWORDS: [&str; 2] = ["x", "y"];
const DESTINATIONS: [&str; 3] = ["/a", "/b", "/c"];
const SUBSCRIPTION_IDS: [&str; 3] = ["1", "2", "3"];

#[derive(Debug, Clone, Arbitrary)]
enum Input {
    Connect { user: u8, pass: u8, receipt: bool },
    Subscribe { destination: u8, id: u8, receipt: bool },
    Unsubscribe { id: u8, receipt: bool },
    Send { destination: u8, body: String, receipt: bool },
    Disconnect { receipt: bool },
    Raw(String),
}

impl Input {
    fn render(&self) -> String {
        let pick = |options: &[&'static str], index: &u8| options[usize::from(*index) % options.len()];
        let with_receipt = |frame: Frame, receipt: bool| {
            if receipt { frame.with_header("receipt", "r") } else { frame }
        };

        let frame = match self {
            Self::Raw(raw) => return raw.clone(),
            Self::Connect { user, pass, receipt } => with_receipt(
                Frame::new(Command::Connect)
                    .with_header("login", pick(&USERS, user))
                    .with_header("passcode", pick(&PASSWORDS, pass)),
                *receipt,
            ),
            Self::Subscribe { destination, id, receipt } => with_receipt(
                Frame::new(Command::Subscribe)
                    .with_header("destination", pick(&DESTINATIONS, destination))
                    .with_header("id", pick(&SUBSCRIPTION_IDS, id)),
                *receipt,
            ),
            Self::Unsubscribe { id, receipt } => with_receipt(
                Frame::new(Command::Unsubscribe).with_header("id", pick(&SUBSCRIPTION_IDS, id)),
                *receipt,
            ),
            Self::Send { destination, body, receipt } => with_receipt(
                Frame::new(Command::Send)
                    .with_header("destination", pick(&DESTINATIONS, destination))
                    .with_body(body.replace('\0', "")),
                *receipt,
            ),
            Self::Disconnect { receipt } => with_receipt(Frame::new(Command::Disconnect), *receipt),
        };
        frame.render()
    }
}

#[derive(Default)]
struct Recorder {
    frames: Mutex<Vec<(Frame, bool)>>,
}

impl ConnectionHandle for Recorder {
    fn send(&self, frame: &Frame) -> bool {
        let mut frames = self.frames.lock().unwrap();
        assert!(frames.last().is_none_or(|(_, last)| !last), "frame after final frame");
        frames.push((frame.clone(), false));
        true
    }

    fn finish(&self, frame: &Frame) -> bool {
        let mut frames = self.frames.lock().unwrap();
        assert!(frames.last().is_none_or(|(_, last)| !last), "second final frame");
        frames.push((frame.clone(), true));
        true
    }

    fn close(&self) {}
}

fuzz_target!(|steps: Vec<(u8, Input)>| {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut connections: Vec<(Arc<Recorder>, ProtocolDriver)> = (1..=3)
        .map(|id| {
            let recorder = Arc::new(Recorder::default());
            registry.register(id, recorder.clone());
            (recorder, ProtocolDriver::new(id, Arc::clone(&registry), Arc::new(NoopAudit)))
        })
        .collect();

    for (conn, input) in &steps {
        let index = usize::from(*conn) % connections.len();
        let (_, driver) = &mut connections[index];

        driver.process(&input.render());
        if driver.should_terminate() {
            registry.disconnect(driver.connection_id());
        }

        for (_, driver) in &connections {
            let id = driver.connection_id();
            let subscribed = DESTINATIONS.iter().filter(|d| registry.is_subscribed(id, d)).count();
            assert_eq!(registry.subscription_count(id), subscribed);
        }
    }

    for (recorder, _) in &connections {
        let frames = recorder.frames.lock().unwrap();
        let errors = frames.iter().filter(|(f, _)| f.command == Command::Error).count();
        let connected = frames.iter().filter(|(f, _)| f.command == Command::Connected).count();

        assert!(errors <= 1);
        assert!(connected <= 1);
        if errors == 1 {
            assert!(frames.last().is_some_and(|(f, last)| *last && f.command == Command::Error));
        }
    }
});
