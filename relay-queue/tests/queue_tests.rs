use std::collections::BTreeMap;
use std::time::Duration;

use relay_queue::{MessageQueue, NewMessage};
use tempfile::tempdir;

fn new_message(table: &str, from: u64, to: u64) -> NewMessage {
    let mut properties = BTreeMap::new();
    properties.insert("Table".to_string(), table.to_string());
    properties.insert("ChangeFrom".to_string(), from.to_string());
    properties.insert("ChangeTo".to_string(), to.to_string());
    NewMessage {
        properties,
        body: format!("body-{table}-{to}").into_bytes(),
    }
}

#[test]
fn queue_locks_acks_and_persists() {
    let dir = tempdir().unwrap();
    let queue_path = dir.path().join("relay.db");
    let mut queue = MessageQueue::open(&queue_path).unwrap();

    let first = queue.enqueue(&new_message("orders", 0, 5)).unwrap();
    let second = queue.enqueue(&new_message("orders", 5, 9)).unwrap();
    assert_eq!(queue.pending_count().unwrap(), 2);

    let lock = Duration::from_secs(60);
    let received = queue.receive(lock).unwrap().unwrap();
    assert_eq!(received.message_id, first);
    assert_eq!(received.delivery_count, 1);
    assert_eq!(received.properties["ChangeTo"], "5");

    // The first message is locked, so the next receive hands out the second.
    let next = queue.receive(lock).unwrap().unwrap();
    assert_eq!(next.message_id, second);
    assert!(queue.receive(lock).unwrap().is_none());

    assert!(queue.ack(received.message_id, received.delivery_count).unwrap());
    assert!(!queue.ack(received.message_id, received.delivery_count).unwrap());
    assert_eq!(queue.pending_count().unwrap(), 1);
    assert_eq!(queue.purge_acknowledged().unwrap(), 1);
    drop(queue);

    // The second message was never acknowledged; reopening keeps it pending.
    let queue = MessageQueue::open(&queue_path).unwrap();
    let pending = queue.peek(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message_id, second);
    assert_eq!(pending[0].body, b"body-orders-9".to_vec());
}

#[test]
fn abandoned_message_is_redelivered_with_new_lock() {
    let dir = tempdir().unwrap();
    let mut queue = MessageQueue::open(dir.path().join("relay.db")).unwrap();
    let id = queue.enqueue(&new_message("customers", 0, 3)).unwrap();

    let first = queue.receive(Duration::from_secs(60)).unwrap().unwrap();
    assert!(queue.abandon(first.message_id, first.delivery_count).unwrap());

    let second = queue.receive(Duration::from_secs(60)).unwrap().unwrap();
    assert_eq!(second.message_id, id);
    assert_eq!(second.delivery_count, 2);

    // The stale delivery can no longer acknowledge the message.
    assert!(!queue.ack(first.message_id, first.delivery_count).unwrap());
    assert!(queue.ack(second.message_id, second.delivery_count).unwrap());
    assert!(queue.receive(Duration::ZERO).unwrap().is_none());
}

#[test]
fn expired_lock_makes_message_visible_again() {
    let dir = tempdir().unwrap();
    let mut queue = MessageQueue::open(dir.path().join("relay.db")).unwrap();
    queue.enqueue(&new_message("customers", 0, 1)).unwrap();

    let first = queue.receive(Duration::ZERO).unwrap().unwrap();
    let again = queue.receive(Duration::ZERO).unwrap().unwrap();
    assert_eq!(first.message_id, again.message_id);
    assert_eq!(again.delivery_count, 2);
}

#[test]
fn dead_lettered_message_is_parked() {
    let dir = tempdir().unwrap();
    let mut queue = MessageQueue::open(dir.path().join("relay.db")).unwrap();
    let id = queue.enqueue(&new_message("orders", 0, 2)).unwrap();

    let delivery = queue.receive(Duration::ZERO).unwrap().unwrap();
    assert!(queue
        .dead_letter(delivery.message_id, delivery.delivery_count, "corrupt envelope")
        .unwrap());

    assert!(queue.receive(Duration::ZERO).unwrap().is_none());
    assert_eq!(queue.pending_count().unwrap(), 0);
    assert_eq!(queue.dead_letter_count().unwrap(), 1);
    let parked = queue.peek_dead_letters(10).unwrap();
    assert_eq!(parked[0].message_id, id);
}

#[test]
fn peek_lists_locked_messages_but_not_acknowledged_ones() {
    let dir = tempdir().unwrap();
    let mut queue = MessageQueue::open(dir.path().join("relay.db")).unwrap();
    let first = queue.enqueue(&new_message("orders", 0, 1)).unwrap();
    let second = queue.enqueue(&new_message("orders", 1, 2)).unwrap();

    let locked = queue.receive(Duration::from_secs(60)).unwrap().unwrap();
    assert_eq!(locked.message_id, first);
    let ids: Vec<i64> = queue.peek(10).unwrap().iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![first, second]);

    assert!(queue.ack(locked.message_id, locked.delivery_count).unwrap());
    let ids: Vec<i64> = queue.peek(10).unwrap().iter().map(|m| m.message_id).collect();
    assert_eq!(ids, vec![second]);
}
