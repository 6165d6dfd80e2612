//! A low-priority joiner blocks on a high-priority worker's `join`, the
//! worker exits with a value, and the joiner observes it — §4.1's
//! `exit`/`join` pair end to end, over real OS threads.
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
static WORKER: OnceLock<&'static TaskCb<StdPort>> = OnceLock::new();
static RESULT_TX: OnceLock<Mutex<Sender<i32>>> = OnceLock::new();

extern "C" fn idle_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    loop {
        let lock = klock::lock_cpu::<StdPort>().unwrap();
        system.sched.yield_now(lock);
    }
}

extern "C" fn worker_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 42)
}

extern "C" fn joiner_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    let worker = *WORKER.get().expect("worker not registered");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    let value = exit::join(worker, &system.sched, lock).expect("join should not be interrupted");
    RESULT_TX
        .get()
        .expect("result channel not set up")
        .lock()
        .unwrap()
        .send(value)
        .expect("test thread dropped the receiver");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 0)
}

#[test]
fn joiner_observes_workers_exit_value() {
    let worker = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 10,
        policy: SchedPolicy::Fifo,
        entry: worker_entry,
        arg: 0,
    );
    WORKER.set(worker).unwrap();

    let joiner = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 5,
        policy: SchedPolicy::Fifo,
        entry: joiner_entry,
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
    RESULT_TX.set(Mutex::new(tx)).unwrap();

    let system: &'static System<StdPort> = SYSTEM.get_or_init(|| unsafe { System::new(idle) });
    set_scheduler(&system.sched);

    unsafe {
        system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), worker);
        system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), joiner);
    }

    thread::spawn(move || unsafe { system.start() });

    let value = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("joiner never reported a result");
    assert_eq!(value, 42);
}
