//! §4.2 priority inheritance: a low-priority owner must not be overtaken by
//! an unrelated medium-priority task while a higher-priority task is blocked
//! waiting for the very mutex the low-priority task holds. Exercises the
//! `Scheduler::reorder_ready` fix (a mutex owner merely Runnable, not
//! Running, still needs its ready-queue bucket moved when PI boosts it).
use std::sync::mpsc::{channel, Sender};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use rros_kernel::{
    builder::System,
    exit, klock,
    mutex::{self, MutexCb, MutexProtocol, RecursionMode},
    task::{SchedPolicy, TaskCb},
    IDLE_PRIORITY,
};
use rros_port_std::{set_scheduler, StdPort};

static SYSTEM: OnceLock<System<StdPort>> = OnceLock::new();
static MEDIUM: OnceLock<&'static TaskCb<StdPort>> = OnceLock::new();
static HIGH: OnceLock<&'static TaskCb<StdPort>> = OnceLock::new();
static MUTEX: MutexCb<StdPort> = MutexCb::new(MutexProtocol::PriorityInheritance, RecursionMode::Normal);
static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
static DONE_TX: OnceLock<Mutex<Sender<()>>> = OnceLock::new();

extern "C" fn idle_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    loop {
        let lock = klock::lock_cpu::<StdPort>().unwrap();
        system.sched.yield_now(lock);
    }
}

extern "C" fn low_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");

    let lock = klock::lock_cpu::<StdPort>().unwrap();
    mutex::lock(&MUTEX, &system.sched, lock).expect("uncontended lock can't fail");
    LOG.lock().unwrap().push("low:acquired");

    // Activating `medium` (priority 5, above `low`'s own 2) preempts this
    // task immediately, same as in the plain preemption scenario.
    let medium = *MEDIUM.get().expect("medium not registered");
    unsafe { system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), medium) };

    LOG.lock().unwrap().push("low:before-unlock");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    mutex::unlock(&MUTEX, &system.sched, lock).expect("low is the owner");

    LOG.lock().unwrap().push("low:after-unlock");
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

extern "C" fn medium_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    LOG.lock().unwrap().push("medium:start");

    // Activating `high` (priority 8) preempts `medium` the same way `medium`
    // just preempted `low`. The point of this test is what happens next:
    // `high` blocks on the mutex `low` still holds, and `low`'s resulting
    // priority boost (to 8) must let it run — and release the mutex —
    // before `medium` ever gets to resume below this line.
    let high = *HIGH.get().expect("high not registered");
    unsafe { system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), high) };

    LOG.lock().unwrap().push("medium:after-activate-high");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 0)
}

extern "C" fn high_entry(_arg: usize) -> ! {
    let system = SYSTEM.get().expect("system not initialized");
    LOG.lock().unwrap().push("high:before-lock");

    let lock = klock::lock_cpu::<StdPort>().unwrap();
    mutex::lock(&MUTEX, &system.sched, lock).expect("low releases it, not abandons it");
    LOG.lock().unwrap().push("high:after-lock");

    let lock = klock::lock_cpu::<StdPort>().unwrap();
    mutex::unlock(&MUTEX, &system.sched, lock).expect("high is the owner");
    let lock = klock::lock_cpu::<StdPort>().unwrap();
    exit::exit(&system.sched, lock, 0)
}

#[test]
fn boosted_owner_runs_before_medium_priority_interloper() {
    let high = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 8,
        policy: SchedPolicy::Fifo,
        entry: high_entry,
        arg: 0,
    );
    HIGH.set(high).unwrap();

    let medium = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 5,
        policy: SchedPolicy::Fifo,
        entry: medium_entry,
        arg: 0,
    );
    MEDIUM.set(medium).unwrap();

    let low = rros_kernel::make_static_thread!(
        port: StdPort,
        stack_size: 65536,
        priority: 2,
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

    // `medium` and `high` start Created; `low` activates `medium`, and
    // `medium` activates `high`, once each is already running.
    unsafe { system.sched.activate(klock::lock_cpu::<StdPort>().unwrap(), low) };

    thread::spawn(move || unsafe { system.start() });

    rx.recv_timeout(Duration::from_secs(5))
        .expect("low never reported completion");
    assert_eq!(
        *LOG.lock().unwrap(),
        vec![
            "low:acquired",
            "medium:start",
            "high:before-lock",
            "low:before-unlock",
            "high:after-lock",
            "medium:after-activate-high",
            "low:after-unlock",
        ]
    );
}
