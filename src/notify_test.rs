use super::*;
use std::time::Duration;

fn notifier(max_toasts: usize) -> Notifier {
    Notifier::new(NotifyConfig { toast_duration: Duration::from_secs(4), max_toasts })
}

// =============================================================================
// toasts
// =============================================================================

#[test]
fn notify_enqueues_in_order() {
    let n = notifier(5);
    n.success("saved");
    n.error("failed");
    let kinds: Vec<_> = n.toasts().iter().map(|t| t.kind).collect();
    assert_eq!(kinds, vec![ToastKind::Success, ToastKind::Error]);
}

#[test]
fn queue_evicts_oldest_beyond_bound() {
    let n = notifier(2);
    let first = n.info("one");
    n.info("two");
    n.info("three");
    let toasts = n.toasts();
    assert_eq!(toasts.len(), 2);
    assert!(toasts.iter().all(|t| t.id != first));
    assert_eq!(toasts[1].message, "three");
}

#[test]
fn dismiss_removes_once() {
    let n = notifier(5);
    let id = n.warning("careful");
    assert!(n.dismiss(id));
    assert!(!n.dismiss(id));
    assert!(n.toasts().is_empty());
}

#[test]
fn prune_expired_respects_deadline() {
    let n = notifier(5);
    let start = Instant::now();
    n.notify_at(ToastKind::Info, "old".into(), start);
    n.notify_at(ToastKind::Info, "new".into(), start + Duration::from_secs(3));

    assert_eq!(n.prune_expired(start + Duration::from_secs(1)), 0);
    assert_eq!(n.prune_expired(start + Duration::from_secs(4)), 1);
    assert_eq!(n.toasts()[0].message, "new");
}

#[test]
fn events_follow_toast_lifecycle() {
    let n = notifier(1);
    let mut rx = n.subscribe();
    let a = n.info("a");
    let b = n.info("b");

    assert!(matches!(rx.try_recv().unwrap(), NotificationEvent::ToastAdded(t) if t.id == a));
    assert_eq!(rx.try_recv().unwrap(), NotificationEvent::ToastRemoved(a));
    assert!(matches!(rx.try_recv().unwrap(), NotificationEvent::ToastAdded(t) if t.id == b));
}

// =============================================================================
// modal
// =============================================================================

#[test]
fn modal_last_writer_wins() {
    let n = notifier(5);
    n.show_modal("confirm booking?");
    let second = n.show_modal("session expired");
    let modal = n.modal().expect("modal");
    assert_eq!(modal.id, second);
    assert_eq!(modal.content, "session expired");
}

#[test]
fn hide_modal_is_idempotent() {
    let n = notifier(5);
    let mut rx = n.subscribe();
    n.show_modal("x");
    n.hide_modal();
    n.hide_modal();
    assert!(n.modal().is_none());

    assert!(matches!(rx.try_recv().unwrap(), NotificationEvent::ModalShown(_)));
    assert_eq!(rx.try_recv().unwrap(), NotificationEvent::ModalHidden);
    assert!(rx.try_recv().is_err());
}
