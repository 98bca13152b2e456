use proptest::prelude::*;
use quotaflow::scope::{format_scope, parse_scope_key};
use quotaflow::{ConfigError, Manager, QuotaError, RequestOptions, Resources, RuleConfig, Scope};

#[tokio::test]
async fn bundle_key_follows_declared_order() {
    let rule = RuleConfig::new("limit-concurrency").limit(1).scope(["propertyId", "userId"]).build().unwrap();
    let scope = Scope::new().with("userId", "u1").with("propertyId", "p|1").with("ignored", "x");
    let bundle = rule.bundle(&scope).unwrap();
    assert_eq!(bundle.key(), "p\\|1|u1");
    assert_eq!(parse_scope_key(bundle.key()), vec!["p|1", "u1"]);
}

#[tokio::test]
async fn colliding_values_get_separate_quota() {
    let manager = Manager::builder()
        .label("keys")
        .rule(RuleConfig::new("limit-concurrency").limit(1).scope(["a", "b"]))
        .build()
        .unwrap();
    let left = Scope::from([("a", "x|"), ("b", "y")]);
    let right = Scope::from([("a", "x"), ("b", "|y")]);

    let _held = manager.request_quota(&left, &Resources::Default, &RequestOptions::default()).await.unwrap();
    manager.request_quota(&right, &Resources::Default, &RequestOptions::default()).await.unwrap().release();
    assert_eq!(manager.rules()[0].bundle_count(), 2);
}

#[tokio::test]
async fn missing_dimension_is_reported_before_anything_else() {
    let manager = Manager::builder()
        .label("keys")
        .rule(RuleConfig::new("limit-concurrency").limit(1).scope(["apiKey"]).queueing("fifo"))
        .build()
        .unwrap();
    let err = manager
        .request_quota(&Scope::new().with("apikey", "k"), &Resources::Default, &RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, QuotaError::Config(ConfigError::MissingScope { name: "apiKey".into() }));
    assert_eq!(manager.rules()[0].bundle_count(), 0);
}

#[test]
fn unscoped_rule_has_an_empty_key() {
    assert_eq!(format_scope(&[], &Scope::from([("userId", "1")])).unwrap(), "");
}

proptest! {
    #[test]
    fn keys_parse_back_into_their_values(values in prop::collection::vec("[a-z|\\\\]{0,6}", 1..5)) {
        let dimensions: Vec<String> = (0..values.len()).map(|i| format!("d{i}")).collect();
        let scope: Scope = dimensions.iter().cloned().zip(values.iter().cloned()).collect();
        let key = format_scope(&dimensions, &scope).unwrap();
        prop_assert_eq!(parse_scope_key(&key), values);
    }

    #[test]
    fn distinct_values_give_distinct_keys(
        a in prop::collection::vec("[xy|\\\\]{0,3}", 2),
        b in prop::collection::vec("[xy|\\\\]{0,3}", 2),
    ) {
        let dimensions = vec!["first".to_string(), "second".to_string()];
        let left: Scope = dimensions.iter().cloned().zip(a.iter().cloned()).collect();
        let right: Scope = dimensions.iter().cloned().zip(b.iter().cloned()).collect();
        let same_key = format_scope(&dimensions, &left).unwrap() == format_scope(&dimensions, &right).unwrap();
        prop_assert_eq!(same_key, a == b);
    }
}
