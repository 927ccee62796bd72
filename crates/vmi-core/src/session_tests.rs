use crate::access::{AccessRights, MemoryAccess};
use crate::config::VmiEventsConfig;
use crate::driver::EventNotification;
use crate::error::VmiError;
use crate::event::{EventPayload, Granularity, InterruptPayload, MemoryPayload, RegisterPayload, Subscription};
use crate::ids::{InterruptVector, Pa, RegisterId, VcpuId};
use crate::session::VmiEventSession;
use crate::testing::MockDriver;

fn enabled_session() -> VmiEventSession<MockDriver> {
    let mut session = VmiEventSession::new(MockDriver::default(), VmiEventsConfig::enabled());
    session.init();
    session
}

#[test]
fn not_enabled_rejects_every_operation() {
    let mut session = VmiEventSession::new(MockDriver::default(), VmiEventsConfig::default());
    session.init();
    let sub = Subscription::new(
        VcpuId::new(0),
        EventPayload::Register(RegisterPayload { register: RegisterId::new(0), access: AccessRights::R, enabled: true }),
        |_, _| {},
    );
    assert!(matches!(session.register_event(sub), Err(VmiError::NotEnabled)));
}

#[test]
fn register_and_clear_round_trip() -> Result<(), VmiError> {
    let mut session = enabled_session();
    let sub = Subscription::new(
        VcpuId::new(0),
        EventPayload::Interrupt(InterruptPayload { vector: InterruptVector::new(3), enabled: true }),
        |_, _| {},
    );
    session.register_event(sub.clone())?;
    assert!(session.get_interrupt_event(InterruptVector::new(3)).is_some());
    session.clear_event(&sub)?;
    assert!(session.get_interrupt_event(InterruptVector::new(3)).is_none());
    Ok(())
}

#[test]
fn teardown_disarms_then_frees_registries() -> Result<(), VmiError> {
    let mut session = enabled_session();
    let sub = Subscription::new(
        VcpuId::new(0),
        EventPayload::Register(RegisterPayload { register: RegisterId::new(1), access: AccessRights::W, enabled: true }),
        |_, _| {},
    );
    session.register_event(sub)?;

    session.teardown()?;

    // The session is disabled after teardown, until re-initialized.
    let sub2 = Subscription::new(
        VcpuId::new(0),
        EventPayload::Register(RegisterPayload { register: RegisterId::new(2), access: AccessRights::R, enabled: true }),
        |_, _| {},
    );
    assert!(matches!(session.register_event(sub2), Err(VmiError::NotEnabled)));
    Ok(())
}

#[test]
fn events_listen_dispatches_memory_notification_to_callback() -> Result<(), VmiError> {
    use std::cell::Cell;
    use std::rc::Rc;

    let mut session = enabled_session();
    let fired = Rc::new(Cell::new(false));
    let fired_clone = fired.clone();

    let address = Pa::new(0x4000_000);
    let sub = Subscription::new(
        VcpuId::new(0),
        EventPayload::Memory(MemoryPayload { address, granularity: Granularity::Page, access: MemoryAccess::W }),
        move |_session: &mut VmiEventSession<MockDriver>, _info: &()| fired_clone.set(true),
    );
    session.register_event(sub)?;

    session.driver.queue_notification(EventNotification::Memory(address, ()));
    session.events_listen(0)?;
    assert!(fired.get());
    Ok(())
}

#[test]
fn step_mem_event_full_cycle_via_events_listen() -> Result<(), VmiError> {
    let mut session = enabled_session();
    let vcpu = VcpuId::new(1);
    let address = Pa::new(0x5000_000);
    let m = Subscription::new(
        vcpu,
        EventPayload::Memory(MemoryPayload { address, granularity: Granularity::Page, access: MemoryAccess::W }),
        |_, _| {},
    );
    session.register_event(m.clone())?;
    session.clear_event(&m)?;

    session.step_mem_event(m, 2)?;
    assert!(session.get_singlestep_event(vcpu).is_some());

    session.driver.queue_notification(EventNotification::SingleStep(vcpu, ()));
    session.driver.queue_notification(EventNotification::SingleStep(vcpu, ()));
    session.events_listen(0)?;

    assert!(session.get_singlestep_event(vcpu).is_none());
    assert!(session.get_mem_event(address, Granularity::Page).is_some());
    Ok(())
}

#[test]
fn step_mem_event_callable_from_within_memory_callback() -> Result<(), VmiError> {
    use std::cell::RefCell;
    use std::rc::Rc;

    // The callback needs its own `Rc<Subscription<_>>` to hand to
    // `step_mem_event`, but that `Rc` doesn't exist until after the
    // closure that captures it is built. Thread it through a shared
    // cell, filled in once construction completes (§5 Scenario 6).
    let self_ref: Rc<RefCell<Option<Rc<Subscription<MockDriver>>>>> = Rc::new(RefCell::new(None));
    let self_ref_for_closure = self_ref.clone();

    let mut session = enabled_session();
    let vcpu = VcpuId::new(2);
    let address = Pa::new(0x6000_000);

    let m = Subscription::new(
        vcpu,
        EventPayload::Memory(MemoryPayload { address, granularity: Granularity::Page, access: MemoryAccess::W }),
        move |session: &mut VmiEventSession<MockDriver>, _info: &()| {
            let this = self_ref_for_closure.borrow().clone().expect("subscription installed before first dispatch");
            session.clear_event(&this).expect("clear_event from within memory callback");
            session.step_mem_event(this, 2).expect("step_mem_event from within memory callback");
        },
    );
    *self_ref.borrow_mut() = Some(m.clone());

    session.register_event(m)?;

    session.driver.queue_notification(EventNotification::Memory(address, ()));
    session.events_listen(0)?;

    // The callback itself disarmed the page and queued the re-arm.
    assert!(session.get_mem_event(address, Granularity::Page).is_none());
    assert!(session.get_singlestep_event(vcpu).is_some());

    session.driver.queue_notification(EventNotification::SingleStep(vcpu, ()));
    session.driver.queue_notification(EventNotification::SingleStep(vcpu, ()));
    session.events_listen(0)?;

    assert!(session.get_singlestep_event(vcpu).is_none());
    assert!(session.get_mem_event(address, Granularity::Page).is_some());
    Ok(())
}
