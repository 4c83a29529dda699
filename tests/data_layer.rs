use resource_store::config::DatasourceConfig;
use resource_store::driver::FaultOp;
use resource_store::{
    AdapterConfig, AppError, DataLayer, Domain, FieldSpec, FilterExpression, MemoryDriver, ParsedRequest,
    QueryRequest, Record, ResourceConfig, SortDirection,
};
use rstest::rstest;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn domain() -> Domain {
    Domain::new()
        .resource(
            "people",
            ResourceConfig::default()
                .field("firstname", FieldSpec::new("string"))
                .field("lastname", FieldSpec::new("string").required())
                .field("prog", FieldSpec::new("integer").default_value(json!(0)))
                .field("rating", FieldSpec::new("float"))
                .soft_delete(),
        )
        .resource(
            "groups",
            ResourceConfig::default()
                .field("name", FieldSpec::new("string").unique())
                .field("members", FieldSpec::new("list").relation("people"))
                .allowed_filters(&["name"]),
        )
        .resource(
            "juniors",
            ResourceConfig::default().datasource(DatasourceConfig {
                source: Some("people".into()),
                filter: json!({"prog__lt": 5}).as_object().cloned(),
                ..Default::default()
            }),
        )
}

async fn layer() -> (DataLayer, MemoryDriver) {
    let driver = MemoryDriver::new();
    let data = DataLayer::init(Arc::new(driver.clone()), &domain(), AdapterConfig::default())
        .await
        .unwrap();
    (data, driver)
}

fn doc(v: Value) -> Record {
    v.as_object().cloned().unwrap()
}

fn by_id(id: &Value) -> FilterExpression {
    FilterExpression::new().with("id", id.clone())
}

async fn seed_people(data: &DataLayer, people: &[(&str, &str, i64)]) -> Vec<Value> {
    let mut docs: Vec<Record> = people
        .iter()
        .map(|(first, last, prog)| doc(json!({"firstname": first, "lastname": last, "prog": prog})))
        .collect();
    data.insert("people", &mut docs).await.unwrap()
}

#[tokio::test]
async fn pages_through_101_rows() {
    let (data, _) = layer().await;
    let mut docs: Vec<Record> = (0..101)
        .map(|i| doc(json!({"lastname": format!("p{:03}", i), "prog": i})))
        .collect();
    data.insert("people", &mut docs).await.unwrap();

    let page = |n: u64| QueryRequest::new().sort_by("prog", SortDirection::Asc).page(10, n);
    let progs = |rs: &resource_store::ResultSet| rs.iter().map(|r| r["prog"].as_i64().unwrap()).collect::<Vec<_>>();

    let first = data.find("people", &page(1), None).await.unwrap();
    assert_eq!(first.count(), 101);
    assert_eq!(progs(&first), (0..10).collect::<Vec<_>>());

    let second = data.find("people", &page(2), None).await.unwrap();
    assert_eq!(progs(&second), (10..20).collect::<Vec<_>>());

    let last = data.find("people", &page(11), None).await.unwrap();
    assert_eq!(progs(&last), vec![100]);
    assert_eq!(last.count(), 101);
}

#[tokio::test]
async fn insert_then_find_one_round_trips() {
    let (data, _) = layer().await;
    let original = doc(json!({"firstname": "john", "lastname": "doe", "prog": 7}));
    let mut docs = vec![original.clone()];
    let ids = data.insert("people", &mut docs).await.unwrap();
    assert_eq!(docs[0]["id"], ids[0]);
    assert!(docs[0]["_created"].is_string());

    let found = data
        .find_one("people", &QueryRequest::new(), &by_id(&ids[0]))
        .await
        .unwrap()
        .unwrap();
    for (field, value) in &original {
        assert_eq!(&found[field], value, "{}", field);
    }
    assert_eq!(found["_deleted"], json!(false));
}

#[tokio::test]
async fn float_fields_read_back_as_written_back() {
    let (data, _) = layer().await;
    let mut docs = vec![doc(json!({"lastname": "doe", "rating": 4}))];
    let ids = data.insert("people", &mut docs).await.unwrap();
    assert_eq!(docs[0]["rating"], json!(4.0));
    let found = data.find_one_raw("people", &ids[0]).await.unwrap().unwrap();
    for (field, value) in &docs[0] {
        assert_eq!(&found[field], value, "{}", field);
    }

    data.update("people", &ids[0], &doc(json!({"rating": 5}))).await.unwrap();
    let found = data.find_one_raw("people", &ids[0]).await.unwrap().unwrap();
    assert_eq!(found["rating"], json!(5.0));
}

#[tokio::test]
async fn defaults_fill_omitted_fields() {
    let (data, _) = layer().await;
    let ids = data.insert("people", &mut [doc(json!({"lastname": "doe"}))]).await.unwrap();
    let found = data.find_one_raw("people", &ids[0]).await.unwrap().unwrap();
    assert_eq!(found["prog"], json!(0));
    assert_eq!(found["firstname"], Value::Null);
}

#[tokio::test]
async fn filter_entries_are_conjunctive() {
    let (data, _) = layer().await;
    seed_people(&data, &[("john", "doe", 1), ("john", "roe", 2), ("jane", "doe", 3)]).await;
    let request = QueryRequest::from_parsed(&ParsedRequest {
        where_: Some(r#"{"firstname": "john", "lastname": "doe"}"#.into()),
        ..Default::default()
    })
    .unwrap();
    let rs = data.find("people", &request, None).await.unwrap();
    assert_eq!(rs.count(), 1);
    assert_eq!(rs.records()[0]["prog"], json!(1));
}

#[tokio::test]
async fn replace_twice_yields_identical_state() {
    let (data, driver) = layer().await;
    seed_people(&data, &[("a", "a", 1), ("b", "b", 2)]).await;
    let ids = data
        .insert("groups", &mut [doc(json!({"name": "g", "members": [1, 2]}))])
        .await
        .unwrap();

    let replacement = doc(json!({"name": "h", "members": [2]}));
    data.replace("groups", &ids[0], &replacement).await.unwrap();
    let groups = driver.rows("groups").await;
    let links = driver.rows("groups_people").await;

    data.replace("groups", &ids[0], &replacement).await.unwrap();
    assert_eq!(driver.rows("groups").await, groups);
    assert_eq!(driver.rows("groups_people").await, links);

    let found = data.find_one("groups", &QueryRequest::new(), &by_id(&ids[0])).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("h"));
    assert_eq!(found["members"], json!([2]));
}

#[tokio::test]
async fn replace_accepts_text_identifier() {
    let (data, _) = layer().await;
    data.replace("people", &json!("42"), &doc(json!({"lastname": "z"}))).await.unwrap();
    let found = data.find_one_raw("people", &json!(42)).await.unwrap().unwrap();
    assert_eq!(found["lastname"], json!("z"));
    let ids = seed_people(&data, &[("n", "next", 0)]).await;
    assert_eq!(ids[0], json!(43));
}

#[tokio::test]
async fn update_missing_id_is_not_found_and_writes_nothing() {
    let (data, driver) = layer().await;
    seed_people(&data, &[("a", "a", 1)]).await;
    let before = driver.rows("people").await;
    let err = data
        .update("people", &json!(999), &doc(json!({"prog": 5})))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(driver.rows("people").await, before);
}

#[tokio::test]
async fn update_ignores_soft_deleted_rows() {
    let (data, _) = layer().await;
    let ids = seed_people(&data, &[("a", "a", 1)]).await;
    data.remove("people", &by_id(&ids[0])).await.unwrap();
    let err = data.update("people", &ids[0], &doc(json!({"prog": 2}))).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn update_applies_fields_and_members() {
    let (data, _) = layer().await;
    seed_people(&data, &[("a", "a", 1), ("b", "b", 2), ("c", "c", 3)]).await;
    let ids = data
        .insert("groups", &mut [doc(json!({"name": "g", "members": [1]}))])
        .await
        .unwrap();
    data.update("groups", &ids[0], &doc(json!({"name": "renamed", "members": [3, 2]})))
        .await
        .unwrap();
    let found = data.find_one("groups", &QueryRequest::new(), &by_id(&ids[0])).await.unwrap().unwrap();
    assert_eq!(found["name"], json!("renamed"));
    assert_eq!(found["members"], json!([3, 2]));
}

#[tokio::test]
async fn remove_all_soft_deletes_visible_rows_only() {
    let (data, driver) = layer().await;
    let ids = seed_people(&data, &[("a", "a", 1), ("b", "b", 2), ("c", "c", 3)]).await;
    assert_eq!(data.remove("people", &by_id(&ids[0])).await.unwrap(), 1);
    let stamped = driver.rows("people").await[0]["_updated"].clone();

    assert_eq!(data.remove("people", &FilterExpression::new()).await.unwrap(), 2);
    let rows = driver.rows("people").await;
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["_deleted"] == json!(true)));
    assert_eq!(rows[0]["_updated"], stamped);

    assert!(data.is_empty("people").await.unwrap());
    let hidden = data.find("people", &QueryRequest::new(), None).await.unwrap();
    assert_eq!(hidden.count(), 0);
    let shown = data.find("people", &QueryRequest::new().show_deleted(true), None).await.unwrap();
    assert_eq!(shown.count(), 3);
    assert!(data.find_one_raw("people", &ids[1]).await.unwrap().is_some());
}

#[tokio::test]
async fn hard_remove_drops_link_rows() {
    let (data, driver) = layer().await;
    seed_people(&data, &[("a", "a", 1)]).await;
    data.insert("groups", &mut [doc(json!({"name": "g", "members": [1]}))])
        .await
        .unwrap();
    let removed = data
        .remove("groups", &FilterExpression::new().with("name", json!("g")))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(driver.rows("groups").await.is_empty());
    assert!(driver.rows("groups_people").await.is_empty());
    assert_eq!(driver.rows("people").await.len(), 1);
}

#[tokio::test]
async fn storage_fault_rolls_back_and_releases_the_transaction() {
    let (data, driver) = layer().await;
    seed_people(&data, &[("a", "a", 1)]).await;
    driver.fail_next(FaultOp::Insert, "groups_people");

    let err = data
        .insert("groups", &mut [doc(json!({"name": "g", "members": [1]}))])
        .await
        .unwrap_err();
    assert!(err.is_storage());
    assert!(driver.rows("groups").await.is_empty());

    let retry = tokio::time::timeout(
        Duration::from_secs(5),
        data.insert("groups", &mut [doc(json!({"name": "g", "members": [1]}))]),
    )
    .await
    .expect("transaction left open")
    .unwrap();
    assert_eq!(retry, vec![json!(1)]);
    assert_eq!(driver.rows("groups_people").await.len(), 1);
}

#[tokio::test]
async fn constraint_violation_surfaces_as_storage_error() {
    let (data, driver) = layer().await;
    data.insert("groups", &mut [doc(json!({"name": "g"}))]).await.unwrap();
    let err = data.insert("groups", &mut [doc(json!({"name": "g"}))]).await.unwrap_err();
    assert!(err.is_storage());
    let err = data
        .insert("groups", &mut [doc(json!({"name": "h", "members": [99]}))])
        .await
        .unwrap_err();
    assert!(err.is_storage());
    assert_eq!(driver.rows("groups").await.len(), 1);
}

#[tokio::test]
async fn batch_failure_keeps_earlier_documents() {
    let (data, driver) = layer().await;
    let mut docs = vec![
        doc(json!({"lastname": "first"})),
        doc(json!({"firstname": "no lastname"})),
        doc(json!({"lastname": "third"})),
    ];
    let err = data.insert("people", &mut docs).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(driver.rows("people").await.len(), 1);
    assert!(docs[0].contains_key("id"));
    assert!(!docs[2].contains_key("id"));
}

#[rstest]
#[case(r#"{"nickname": "x"}"#)]
#[case(r#"{"prog__like": "1%"}"#)]
#[case("firstname == 'john'")]
#[tokio::test]
async fn bad_where_clauses_are_validation_errors(#[case] where_: &str) {
    let (data, _) = layer().await;
    let outcome = match QueryRequest::from_parsed(&ParsedRequest {
        where_: Some(where_.into()),
        ..Default::default()
    }) {
        Ok(request) => data.find("people", &request, None).await.map(|_| ()),
        Err(e) => Err(e),
    };
    assert!(outcome.unwrap_err().is_validation());
}

#[tokio::test]
async fn disallowed_client_filter_is_rejected_but_lookup_is_not() {
    let (data, _) = layer().await;
    let ids = data.insert("groups", &mut [doc(json!({"name": "g"}))]).await.unwrap();
    let request = QueryRequest::new().filter(FilterExpression::new().with("id", ids[0].clone()));
    let err = data.find("groups", &request, None).await.unwrap_err();
    assert!(err.to_string().contains("filter on 'id' not allowed"));
    let found = data.find("groups", &QueryRequest::new(), Some(&by_id(&ids[0]))).await.unwrap();
    assert_eq!(found.count(), 1);
}

#[tokio::test]
async fn alias_reads_through_its_datasource_filter() {
    let (data, _) = layer().await;
    seed_people(&data, &[("a", "a", 1), ("b", "b", 9), ("c", "c", 4)]).await;
    let juniors = data.find("juniors", &QueryRequest::new(), None).await.unwrap();
    let names: Vec<_> = juniors.iter().map(|r| r["lastname"].clone()).collect();
    assert_eq!(names, vec![json!("a"), json!("c")]);
    assert!(data.find_one_raw("juniors", &json!(2)).await.unwrap().is_some());
}

#[tokio::test]
async fn find_list_of_ids_applies_projection() {
    let (data, _) = layer().await;
    seed_people(&data, &[("a", "a", 1), ("b", "b", 2), ("c", "c", 3)]).await;
    let projection = vec![("lastname".to_string(), true)];
    let records = data
        .find_list_of_ids("people", &[json!(3), json!(1)], Some(&projection))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], json!(1));
    assert!(records[0].contains_key("lastname"));
    assert!(!records[0].contains_key("firstname"));
}

#[tokio::test]
async fn unknown_resource_is_not_found() {
    let (data, _) = layer().await;
    let err = data.find("nope", &QueryRequest::new(), None).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn aggregate_is_not_supported() {
    let (data, _) = layer().await;
    let err = data.aggregate("people", &[json!({"$match": {}})]).await.unwrap_err();
    assert!(matches!(err, AppError::NotSupported("aggregate")));
}

#[test]
fn query_helpers() {
    let a = FilterExpression::new().with("firstname", json!("john"));
    let b = FilterExpression::new().with("prog__gt", json!(3));
    let both = DataLayer::combine_queries(a, b);
    assert_eq!(both.len(), 2);
    assert!(DataLayer::query_contains_field(&both, "prog"));
    assert_eq!(DataLayer::get_value_from_query(&both, "firstname"), Some(&json!("john")));
    assert_eq!(DataLayer::get_value_from_query(&both, "prog"), None);
}
