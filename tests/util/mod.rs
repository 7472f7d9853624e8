// Not all helpers are used by every test binary.
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Finds a free localhost port by asking the OS for one.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("couldn't probe for a free port");
    listener.local_addr().unwrap().port()
}
