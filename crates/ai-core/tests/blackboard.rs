use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ai_core::{
    Blackboard, BlackboardSchema, KeyId, KeySelector, KeyType, ObjectHandle, ObserverOwner,
    ObserverResult, SchemaError,
};

fn agent_schema() -> Arc<BlackboardSchema> {
    BlackboardSchema::builder("Agent")
        .key("Alert", KeyType::Bool)
        .key("Ammo", KeyType::Int)
        .key("Target", KeyType::Vector)
        .key("Enemy", KeyType::Object)
        .build()
}

fn counting_observer(counter: &Arc<AtomicUsize>) -> ai_core::ObserverCallback {
    let counter = counter.clone();
    Box::new(move |_key| {
        counter.fetch_add(1, Ordering::SeqCst);
        ObserverResult::Keep
    })
}

#[test]
fn blackboard_set_get_roundtrip() {
    let mut bb = Blackboard::with_schema(agent_schema());

    assert!(bb.set("Ammo", 12i32));
    assert!(bb.set("Target", [1.0f32, 2.0, 3.0]));
    assert!(bb.set("Alert", true));
    assert!(bb.set("Enemy", ObjectHandle(42)));

    assert_eq!(bb.get::<i32>("Ammo"), 12);
    assert_eq!(bb.get::<[f32; 3]>("Target"), [1.0, 2.0, 3.0]);
    assert!(bb.get::<bool>("Alert"));
    assert_eq!(bb.get::<ObjectHandle>("Enemy"), ObjectHandle(42));
}

#[test]
fn type_mismatch_reads_default_and_ignores_writes() {
    let mut bb = Blackboard::with_schema(agent_schema());
    bb.set("Ammo", 3i32);

    assert_eq!(bb.get::<f32>("Ammo"), 0.0);
    assert_eq!(bb.try_get::<f32>("Ammo"), None);
    assert!(!bb.set("Ammo", 1.5f32));
    assert_eq!(bb.get::<i32>("Ammo"), 3);
    assert!(!bb.set("Missing", 1i32));
}

#[test]
fn observer_fires_once_per_change() {
    let mut bb = Blackboard::with_schema(agent_schema());
    let counter = Arc::new(AtomicUsize::new(0));
    let key = bb.key_id("Ammo").unwrap();
    bb.register_observer(key, ObserverOwner(1), counting_observer(&counter))
        .unwrap();

    bb.set(key, 7i32);
    bb.set(key, 7i32);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    bb.set(key, 8i32);
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn observer_can_remove_itself() {
    let mut bb = Blackboard::with_schema(agent_schema());
    let key = bb.key_id("Alert").unwrap();
    bb.register_observer(key, ObserverOwner(1), Box::new(|_| ObserverResult::Remove));

    assert_eq!(bb.observer_count(key), 1);
    bb.set(key, true);
    assert_eq!(bb.observer_count(key), 0);
}

#[test]
fn unregister_by_owner_drops_all_registrations() {
    let mut bb = Blackboard::with_schema(agent_schema());
    let counter = Arc::new(AtomicUsize::new(0));
    bb.register_observer("Ammo", ObserverOwner(5), counting_observer(&counter));
    bb.register_observer("Alert", ObserverOwner(5), counting_observer(&counter));
    let other = bb
        .register_observer("Alert", ObserverOwner(6), counting_observer(&counter))
        .unwrap();

    bb.unregister_observers_from(ObserverOwner(5));
    bb.set("Ammo", 1i32);
    bb.set("Alert", true);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let alert = bb.key_id("Alert").unwrap();
    bb.unregister_observer(alert, other);
    bb.set("Alert", false);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn paused_notifications_flush_in_order_without_duplicates() {
    let mut bb = Blackboard::with_schema(agent_schema());
    let seen = Arc::new(Mutex::new(Vec::<KeyId>::new()));
    for name in ["Ammo", "Alert"] {
        let seen = seen.clone();
        bb.register_observer(
            name,
            ObserverOwner(1),
            Box::new(move |key| {
                seen.lock().unwrap().push(key);
                ObserverResult::Keep
            }),
        );
    }

    bb.pause_updates();
    bb.set("Ammo", 1i32);
    bb.set("Alert", true);
    bb.set("Ammo", 2i32);
    assert!(seen.lock().unwrap().is_empty());

    bb.resume_updates();
    let ammo = bb.key_id("Ammo").unwrap();
    let alert = bb.key_id("Alert").unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![ammo, alert]);
}

#[test]
fn inherited_keys_come_first_and_compatibility_follows_the_chain() {
    let base = agent_schema();
    let soldier = BlackboardSchema::builder("Soldier")
        .parent(base.clone())
        .key("Squad", KeyType::Enum)
        .build();

    assert_eq!(soldier.first_key_id(), 4);
    assert_eq!(soldier.key_id("Squad"), Some(KeyId(4)));
    assert_eq!(soldier.key_id("Ammo"), Some(KeyId(1)));

    let bb = Blackboard::with_schema(soldier.clone());
    assert!(bb.is_compatible_with(&base));
    assert!(bb.is_compatible_with(&soldier));

    let unrelated = BlackboardSchema::builder("Other").build();
    assert!(!bb.is_compatible_with(&unrelated));

    let base_only = Blackboard::with_schema(base);
    assert!(!base_only.is_compatible_with(&soldier));
}

#[test]
fn key_count_past_the_id_range_is_rejected_across_the_chain() {
    let mut wide = BlackboardSchema::builder("Wide");
    for i in 0..u16::MAX as usize + 10 {
        wide = wide.key(format!("k{i}"), KeyType::Bool);
    }
    let wide = wide.build();
    let child = BlackboardSchema::builder("Child")
        .parent(wide)
        .key("Extra", KeyType::Int)
        .build();

    assert_eq!(child.num_keys(), u16::MAX as usize + 11);
    assert_eq!(child.key_id("Extra"), None);
    assert_eq!(
        child.validate(),
        Err(SchemaError::TooManyKeys {
            schema: "Child".into()
        })
    );
    let mut bb = Blackboard::new();
    assert!(!bb.bind(child));
}

#[test]
fn duplicate_key_names_are_rejected() {
    let base = agent_schema();
    let broken = BlackboardSchema::builder("Broken")
        .parent(base)
        .key("Ammo", KeyType::Float)
        .build();

    assert_eq!(
        broken.validate(),
        Err(SchemaError::DuplicateKey {
            schema: "Broken".into(),
            key: "Ammo".into(),
        })
    );

    let mut bb = Blackboard::new();
    assert!(!bb.bind(broken));
    assert!(!bb.is_bound());
}

#[test]
fn rebinding_same_schema_keeps_values() {
    let schema = agent_schema();
    let mut bb = Blackboard::with_schema(schema.clone());
    bb.set("Ammo", 9i32);
    assert!(bb.bind(schema));
    assert_eq!(bb.get::<i32>("Ammo"), 9);
}

#[test]
fn key_selector_resolves_per_schema_and_checks_type() {
    let schema = agent_schema();
    let ammo = KeySelector::new("Ammo").of_type(KeyType::Int);
    assert_eq!(ammo.resolve(&schema), Some(KeyId(1)));

    let other = BlackboardSchema::builder("Turret")
        .key("Ammo", KeyType::Int)
        .build();
    assert_eq!(ammo.resolve(&other), Some(KeyId(0)));
    assert_eq!(ammo.resolve(&schema), Some(KeyId(1)));

    let wrong = KeySelector::new("Ammo").of_type(KeyType::Bool);
    assert_eq!(wrong.resolve(&schema), None);

    let mut bb = Blackboard::with_schema(schema);
    bb.set(&ammo, 4i32);
    assert_eq!(bb.get::<i32>(&ammo), 4);
}

#[test]
fn clear_value_and_is_set() {
    let mut bb = Blackboard::with_schema(agent_schema());
    assert!(!bb.is_set("Enemy"));
    bb.set("Enemy", ObjectHandle(3));
    assert!(bb.is_set("Enemy"));
    bb.clear_value("Enemy");
    assert!(!bb.is_set("Enemy"));
    assert_eq!(bb.describe_value(KeyId(1)).as_deref(), Some("0"));
}
