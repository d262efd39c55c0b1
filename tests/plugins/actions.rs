use quire::core::descriptor::{FieldKind, FieldSpec, FieldTransform, SchemaDescriptor};
use quire::core::error::QuireError;
use quire::core::query::FindOptions;
use quire::core::store::Store;
use quire::plugins::actions::{
    self, ActionDescriptor, ActionKind, ActionPlan, PlanKind, Statement,
};
use serde_json::json;

fn setup() -> Store {
    let store = Store::open_in_memory().unwrap();
    store
        .register_schema(
            SchemaDescriptor::new("todo")
                .field("text", FieldSpec::new(FieldKind::String).required())
                .field(
                    "completed",
                    FieldSpec::new(FieldKind::Boolean)
                        .transform(FieldTransform::Default(json!(false))),
                ),
        )
        .unwrap();
    store
}

fn run(store: &Store, descriptor: ActionDescriptor) -> actions::ExecutionResult {
    let plan = actions::generate(&descriptor, &store.schema_snapshot().unwrap()).unwrap();
    actions::execute(store, &plan).unwrap()
}

#[test]
fn test_delete_all_soft_deletes_every_active_record() {
    let store = Store::open_in_memory().unwrap();
    for i in 0..5 {
        store.create("note", json!({"n": i}), None).unwrap();
    }
    store.create("todo", json!({"text": "untouched"}), None).unwrap();

    let descriptor = ActionDescriptor::new(ActionKind::DeleteAll, "note");
    let plan = actions::generate(&descriptor, &store.schema_snapshot().unwrap()).unwrap();
    assert_eq!(plan.kind, PlanKind::Write);
    assert!(plan.requires_confirmation);
    assert_eq!(plan.estimated_records, Some(5));
    assert_eq!(plan.affected_types, vec!["note".to_string()]);

    let result = actions::execute(&store, &plan).unwrap();
    assert!(result.success);
    assert_eq!(result.rows_affected, Some(5));

    assert_eq!(store.count("note", &json!({}), &FindOptions::default()).unwrap(), 0);
    assert_eq!(store.count_including_deleted("note").unwrap(), 5);
    assert_eq!(store.count("todo", &json!({}), &FindOptions::default()).unwrap(), 1);
}

#[test]
fn test_create_and_create_many() {
    let store = setup();
    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::Create, "todo").with_data(json!({"text": "one"})),
    );
    assert_eq!(result.rows_affected, Some(1));

    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::CreateMany, "todo")
            .with_items(vec![json!({"text": "two"}), json!({"text": "three"})]),
    );
    assert_eq!(result.rows_affected, Some(2));
    assert_eq!(store.count("todo", &json!({}), &FindOptions::default()).unwrap(), 3);
}

#[test]
fn test_failing_write_plan_rolls_back_everything() {
    let store = setup();
    let plan = ActionPlan::from_statements(
        vec![
            Statement::Insert {
                entity_type: "todo".into(),
                docs: vec![json!({"text": "fine"})],
            },
            Statement::Insert {
                entity_type: "todo".into(),
                docs: vec![json!({"completed": true})],
            },
        ],
        "two inserts",
    );
    let result = actions::execute(&store, &plan).unwrap();
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap_or("").contains("text"));
    assert_eq!(store.count_including_deleted("todo").unwrap(), 0);

    let err = result.into_result().unwrap_err();
    assert!(matches!(err, QuireError::TransactionFailure(_)));
}

#[test]
fn test_update_touches_first_match_and_update_many_all() {
    let store = setup();
    for text in ["a", "b", "c"] {
        store.create("todo", json!({"text": text}), None).unwrap();
    }

    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::Update, "todo")
            .with_filters(json!({"completed": false}))
            .with_updates(json!({"completed": true})),
    );
    assert_eq!(result.rows_affected, Some(1));
    let first = store
        .find_one("todo", &json!({"text": "a"}), &FindOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(first.data["completed"], true);

    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::UpdateMany, "todo")
            .with_filters(json!({"completed": false}))
            .with_updates(json!({"completed": true})),
    );
    assert_eq!(result.rows_affected, Some(2));
    assert_eq!(
        store.count("todo", &json!({"completed": true}), &FindOptions::default()).unwrap(),
        3
    );
}

#[test]
fn test_targeted_writes_reject_missing_inputs() {
    let store = setup();
    let snapshot = store.schema_snapshot().unwrap();
    for descriptor in [
        ActionDescriptor::new(ActionKind::Update, "todo").with_updates(json!({"text": "x"})),
        ActionDescriptor::new(ActionKind::Delete, "todo"),
        ActionDescriptor::new(ActionKind::DeleteMany, "todo").with_filters(json!({})),
        ActionDescriptor::new(ActionKind::Toggle, "todo")
            .with_field("completed")
            .with_filters(json!({})),
        ActionDescriptor::new(ActionKind::Toggle, "todo").with_filters(json!({"text": "a"})),
        ActionDescriptor::new(ActionKind::UpdateMany, "todo").with_filters(json!({"text": "a"})),
        ActionDescriptor::new(ActionKind::Create, "todo"),
    ] {
        let err = actions::generate(&descriptor, &snapshot).unwrap_err();
        assert!(matches!(err, QuireError::ValidationError(_)), "{:?}", descriptor.action);
    }
}

#[test]
fn test_toggle_flips_boolean_and_treats_missing_as_false() {
    let store = Store::open_in_memory().unwrap();
    store.create("todo", json!({"text": "a", "completed": false}), None).unwrap();
    store.create("todo", json!({"text": "b"}), None).unwrap();

    let toggle = |text: &str| {
        run(
            &store,
            ActionDescriptor::new(ActionKind::Toggle, "todo")
                .with_filters(json!({"text": text}))
                .with_field("completed"),
        )
    };
    let completed = |text: &str| {
        store
            .find_one("todo", &json!({"text": text}), &FindOptions::default())
            .unwrap()
            .unwrap()
            .data["completed"]
            .clone()
    };

    assert_eq!(toggle("a").rows_affected, Some(1));
    assert_eq!(completed("a"), json!(true));
    toggle("a");
    assert_eq!(completed("a"), json!(false));

    toggle("b");
    assert_eq!(completed("b"), json!(true));

    assert_eq!(toggle("nobody").rows_affected, Some(0));
}

#[test]
fn test_delete_removes_only_first_match() {
    let store = Store::open_in_memory().unwrap();
    store.create("note", json!({"tag": "x"}), None).unwrap();
    store.create("note", json!({"tag": "x"}), None).unwrap();

    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::Delete, "note").with_filters(json!({"tag": "x"})),
    );
    assert_eq!(result.rows_affected, Some(1));
    assert_eq!(store.count("note", &json!({}), &FindOptions::default()).unwrap(), 1);

    let result = run(
        &store,
        ActionDescriptor::new(ActionKind::DeleteMany, "note").with_filters(json!({"tag": "x"})),
    );
    assert_eq!(result.rows_affected, Some(1));
    assert_eq!(store.count_including_deleted("note").unwrap(), 2);
}

#[test]
fn test_find_action_is_a_read_plan() {
    let store = setup();
    for text in ["b", "a", "c"] {
        store.create("todo", json!({"text": text}), None).unwrap();
    }
    let mut descriptor = ActionDescriptor::new(ActionKind::Find, "todo");
    descriptor.order_by = vec!["text".to_string()];
    descriptor.limit = Some(2);

    let plan = actions::generate(&descriptor, &store.schema_snapshot().unwrap()).unwrap();
    assert_eq!(plan.kind, PlanKind::Read);
    assert!(!plan.requires_confirmation);

    let result = actions::execute(&store, &plan).unwrap();
    let rows = result.rows.unwrap();
    let texts: Vec<&str> = rows.iter().map(|r| r["data"]["text"].as_str().unwrap()).collect();
    assert_eq!(texts, vec!["a", "b"]);
    assert_eq!(rows[0]["type"], "todo");
}

#[test]
fn test_raw_reads_and_writes() {
    let store = Store::open_in_memory().unwrap();
    store.create("note", json!({"n": 1}), None).unwrap();
    store.create("note", json!({"n": 2}), None).unwrap();

    let read = ActionPlan::from_statements(
        vec![Statement::Raw {
            sql: "SELECT SUM(json_extract(data, '$.n')) AS total FROM records WHERE entity_type = ?"
                .into(),
            params: vec![json!("note")],
        }],
        "sum",
    );
    assert_eq!(read.kind, PlanKind::Read);
    let rows = actions::execute(&store, &read).unwrap().rows.unwrap();
    assert_eq!(rows, vec![json!({"total": 3})]);

    // Prime the cache, then write around it.
    assert_eq!(store.find("note", &json!({"n": 1}), &FindOptions::default()).unwrap().len(), 1);
    let write = ActionPlan::from_statements(
        vec![Statement::Raw {
            sql: "UPDATE records SET data = json_set(data, '$.n', 7) WHERE entity_type = 'note'"
                .into(),
            params: vec![],
        }],
        "bulk set",
    );
    assert!(write.requires_confirmation);
    let result = actions::execute(&store, &write).unwrap();
    assert_eq!(result.rows_affected, Some(2));
    assert!(store.find("note", &json!({"n": 1}), &FindOptions::default()).unwrap().is_empty());
    assert_eq!(store.count("note", &json!({"n": 7}), &FindOptions::default()).unwrap(), 2);
}

#[test]
fn test_raw_read_inside_write_plan_is_skipped() {
    let store = Store::open_in_memory().unwrap();
    store.create("note", json!({"n": 1}), None).unwrap();

    let plan = ActionPlan::from_statements(
        vec![
            Statement::Raw {
                sql: "SELECT COUNT(*) AS n FROM records WHERE entity_type = 'note'".into(),
                params: vec![],
            },
            Statement::Raw {
                sql: "UPDATE records SET data = json_set(data, '$.n', 5) WHERE entity_type = 'note'"
                    .into(),
                params: vec![],
            },
        ],
        "look then write",
    );
    assert_eq!(plan.kind, PlanKind::Write);
    let result = actions::execute(&store, &plan).unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.rows_affected, Some(1));
    assert_eq!(store.count("note", &json!({"n": 5}), &FindOptions::default()).unwrap(), 1);
}

#[test]
fn test_policy_violations_are_errors_and_change_nothing() {
    let store = Store::open_in_memory().unwrap();
    store.create("note", json!({"n": 1}), None).unwrap();

    for sql in [
        "DROP TABLE records",
        "DELETE FROM index_catalog",
        "SELECT name FROM sqlite_master",
        "DELETE FROM records; DROP TABLE records",
    ] {
        let plan = ActionPlan::from_statements(
            vec![Statement::Raw {
                sql: sql.into(),
                params: vec![],
            }],
            "hostile",
        );
        let err = actions::execute(&store, &plan).unwrap_err();
        assert!(matches!(err, QuireError::PolicyViolation(_)), "{sql}");
    }
    assert_eq!(store.count("note", &json!({}), &FindOptions::default()).unwrap(), 1);
}

#[test]
fn test_read_plan_with_write_statement_is_rejected() {
    let store = Store::open_in_memory().unwrap();
    store.create("note", json!({"n": 1}), None).unwrap();
    let mut plan = ActionPlan::from_statements(
        vec![Statement::Delete {
            entity_type: "note".into(),
            filter: json!({}),
            many: true,
            soft: true,
        }],
        "sneaky",
    );
    plan.kind = PlanKind::Read;
    plan.requires_confirmation = false;

    let err = actions::execute(&store, &plan).unwrap_err();
    assert!(matches!(err, QuireError::PolicyViolation(_)));
    assert_eq!(store.count("note", &json!({}), &FindOptions::default()).unwrap(), 1);
}

#[test]
fn test_descriptor_wire_format() {
    let descriptor: ActionDescriptor = serde_json::from_value(json!({
        "action": "deleteMany",
        "entityType": "todo",
        "filters": {"completed": true},
    }))
    .unwrap();
    assert_eq!(descriptor.action, ActionKind::DeleteMany);
    assert_eq!(descriptor.entity_type, "todo");

    let plan = actions::generate(&descriptor, &Default::default()).unwrap();
    let wire = serde_json::to_value(&plan).unwrap();
    assert_eq!(wire["kind"], "write");
    assert_eq!(wire["requiresConfirmation"], true);
    assert_eq!(wire["statements"][0]["op"], "delete");
    assert_eq!(wire["statements"][0]["many"], true);
}
