//! A low-priority task activates a higher-priority one from inside its own
//! body; §4.1's "if the thread outranks Current, request a context switch"
//! must preempt the low-priority task immediately, mid-body, rather than
//! waiting for it to block or yield on its own.
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use rros_kernel::{
    builder::System,
    exit, klock,
    task::{SchedPolicy, TaskCb},
    IDLE_PRIORITY,
};
use rros_port_std::{set_scheduler, StdPort};

static SYSTEM: OnceLock<System<StdPort>> = OnceLock::new();
static HIGH: OnceLock<&'static TaskCb<StdPort>> = OnceLock::new();
static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
static DONE_TX: OnceLock<Mutex<Sender<()>>> = OnceLock::new();

extern "C" fn idle_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    loop {
        let lock = klock::lock_cpu::<StdPort>().unwrap();
        system.sched.yield_now(lock);
    }
}

extern "C" fn high_entry(_arg: usize) -> ! {
    LOG.lock().unwrap().push("high");
    let system = SYSTEM.get().expect("system not initialized");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 0)
}

extern "C" fn low_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    LOG.lock().unwrap().push("low-before");

    // Activating `high` (priority 7, above `low`'s own 3) must preempt this
    // very task before the next line ever runs.
    let high = *HIGH.get().expect("high not registered");
    unsafe { system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), high) };

    LOG.lock().unwrap().push("low-after");
    DONE_TX
        .get()
        .expect("done channel not set up")
        .lock()
        .unwrap()
        .send(())
        .expect("test thread dropped the receiver");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 0)
}

#[test]
fn high_priority_task_preempts_low_mid_body() {
    let high = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 7,
        policy: SchedPolicy::Fifo,
        entry: high_entry,
        arg: 0,
    );
    HIGH.set(high).unwrap();

    let low = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 3,
        policy: SchedPolicy::Fifo,
        entry: low_entry,
        arg: 0,
    );

    let idle = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: IDLE_PRIORITY,
        policy: SchedPolicy::Fifo,
        entry: idle_entry,
        arg: 0,
    );

    let (tx, rx) = channel();
    DONE_TX.set(Mutex::new(tx)).unwrap();

    let system: &'static System<StdPort> = SYSTEM.get_or_init(|| unsafe { System::new(idle) });
    set_scheduler(&system.sched);

    // `high` is left Created — `low` is the one that activates it, once
    // already running, so the ready queue at `start()` time holds only
    // `low` and `idle`.
    unsafe { system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), low) };

    thread::spawn(move || unsafe { system.start() });

    rx.recv_timeout(Duration::from_secs(5))
        .expect("low never reported completion");
    assert_eq!(*LOG.lock().unwrap(), vec!["low-before", "high", "low-after"]);
}
