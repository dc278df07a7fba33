// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cancellation plumbing. The handler only stores into an atomic; the
//! execute RPC polls the flag and winds down cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_signal: nix::libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

/// Install handlers for the signals that should cancel an in-flight
/// remote execution rather than kill the process outright.
pub fn setup_signals() {
    let action = SigAction::new(
        SigHandler::Handler(handle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGPIPE,
    ] {
        if unsafe { sigaction(signal, &action) }.is_err() {
            eprintln!("recc: unable to register signal handler for {}", signal);
        }
    }
}

pub fn stop_token() -> &'static AtomicBool {
    &STOP_REQUESTED
}

pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Relaxed)
}
