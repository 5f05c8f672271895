// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{net::TcpListener, thread, time};

/// Poll until the predicate holds; panics after five seconds.
pub fn wait_until<P>(mut pred: P)
where
    P: FnMut() -> bool,
{
    let deadline = time::Instant::now() + time::Duration::from_secs(5);
    while !pred() {
        if time::Instant::now() > deadline {
            panic!("condition never became true");
        }
        thread::sleep(time::Duration::from_millis(2));
    }
}

/// Grab an ephemeral port that is free right now. Slightly racy, but
/// good enough for tests.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("binding probe listener");
    listener.local_addr().expect("probe listener addr").port()
}

pub fn yogi_bin() -> &'static str {
    env!("CARGO_BIN_EXE_yogi")
}
