//! Proxy operation tests against an in-process grid

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tokio_stream::StreamExt;
use tonic::{Code, Request};

use grid::{Aggregator, BinaryProcessor, Comparator, Extractor, Filter};
use hoardd::{build_resolver, CacheProxy, ProxyConfig};
use proto::api::*;
use proto::NamedCache;

fn test_config() -> ProxyConfig {
  ProxyConfig {
    transfer_threshold: 256,
    event_buffer: 64,
    worker_threads: 2,
    partitions: 13,
    members: 3,
    ..ProxyConfig::default()
  }
}

fn proxy() -> CacheProxy {
  let config = test_config();
  let resolver = build_resolver(&config);
  CacheProxy::new(resolver, config).unwrap()
}

fn proxy_with_resolver() -> (CacheProxy, std::sync::Arc<hoardd::CacheResolver>) {
  let config = test_config();
  let resolver = build_resolver(&config);
  (CacheProxy::new(resolver.clone(), config).unwrap(), resolver)
}

fn msgpack(value: &Value) -> Vec<u8> {
  rmp_serde::to_vec(value).unwrap()
}

fn jsonb(value: &Value) -> Vec<u8> {
  serde_json::to_vec(value).unwrap()
}

fn payload<T: serde::Serialize>(codec: fn(&Value) -> Vec<u8>, payload: &T) -> Vec<u8> {
  codec(&serde_json::to_value(payload).unwrap())
}

async fn put(proxy: &CacheProxy, cache: &str, format: &str, key: Vec<u8>, value: Vec<u8>) {
  proxy
    .put(Request::new(PutRequest {
      scope: String::new(),
      cache: cache.into(),
      format: format.into(),
      key,
      value,
      ttl: 0,
    }))
    .await
    .unwrap();
}

async fn get(proxy: &CacheProxy, cache: &str, format: &str, key: Vec<u8>) -> OptionalValue {
  proxy
    .get(Request::new(GetRequest {
      scope: String::new(),
      cache: cache.into(),
      format: format.into(),
      key,
    }))
    .await
    .unwrap()
    .into_inner()
}

// =============================================================================
// Point operations and format bridging
// =============================================================================

#[tokio::test]
async fn put_get_roundtrip_passthrough_leaves_bytes_untouched() {
  let proxy = proxy();
  // native-format payloads cross the proxy opaque; these bytes are never
  // decoded
  put(&proxy, "people", "msgpack", vec![0x01], vec![0xAA, 0xBB]).await;

  let result = get(&proxy, "people", "msgpack", vec![0x01]).await;
  assert!(result.present);
  assert_eq!(result.value, vec![0xAA, 0xBB]);
}

#[tokio::test]
async fn cross_format_put_and_get_preserve_the_logical_value() {
  let proxy = proxy();
  let logical = json!({"id": 1});

  // a json client stores the value
  put(
    &proxy,
    "people",
    "json",
    jsonb(&json!("k1")),
    jsonb(&logical),
  )
  .await;

  // a msgpack client observes the msgpack encoding of the same value
  let native = get(&proxy, "people", "msgpack", msgpack(&json!("k1"))).await;
  assert!(native.present);
  assert_eq!(
    rmp_serde::from_slice::<Value>(&native.value).unwrap(),
    logical
  );

  // another json client gets json back
  let back = get(&proxy, "people", "json", jsonb(&json!("k1"))).await;
  assert!(back.present);
  assert_eq!(serde_json::from_slice::<Value>(&back.value).unwrap(), logical);
}

#[tokio::test]
async fn get_distinguishes_null_mapping_from_absent_key() {
  let proxy = proxy();
  put(
    &proxy,
    "people",
    "json",
    jsonb(&json!("present")),
    jsonb(&Value::Null),
  )
  .await;

  let present = get(&proxy, "people", "json", jsonb(&json!("present"))).await;
  assert!(present.present);
  assert_eq!(serde_json::from_slice::<Value>(&present.value).unwrap(), Value::Null);

  let absent = get(&proxy, "people", "json", jsonb(&json!("missing"))).await;
  assert!(!absent.present);
}

#[tokio::test]
async fn put_returns_prior_value_in_client_format() {
  let proxy = proxy();
  put(&proxy, "people", "json", jsonb(&json!("k")), jsonb(&json!(1))).await;

  let response = proxy
    .put(Request::new(PutRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
      value: jsonb(&json!(2)),
      ttl: 0,
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(serde_json::from_slice::<Value>(&response.value).unwrap(), json!(1));
}

#[tokio::test]
async fn put_with_ttl_expires() {
  let proxy = proxy();
  proxy
    .put(Request::new(PutRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("ttl")),
      value: jsonb(&json!(1)),
      ttl: 20,
    }))
    .await
    .unwrap();

  tokio::time::sleep(std::time::Duration::from_millis(60)).await;
  let result = get(&proxy, "people", "json", jsonb(&json!("ttl"))).await;
  assert!(!result.present);
}

#[tokio::test]
async fn put_if_absent_and_replace_semantics() {
  let proxy = proxy();
  let key = jsonb(&json!("k"));

  // replace on an absent key is a no-op
  let replaced = proxy
    .replace(Request::new(ReplaceRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      value: jsonb(&json!(9)),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(replaced.value.is_empty());
  assert!(!get(&proxy, "people", "json", key.clone()).await.present);

  let first = proxy
    .put_if_absent(Request::new(PutIfAbsentRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      value: jsonb(&json!(1)),
      ttl: 0,
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(first.value.is_empty());

  let second = proxy
    .put_if_absent(Request::new(PutIfAbsentRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      value: jsonb(&json!(2)),
      ttl: 0,
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(serde_json::from_slice::<Value>(&second.value).unwrap(), json!(1));
}

#[tokio::test]
async fn conditional_mappings() {
  let proxy = proxy();
  let key = jsonb(&json!("k"));
  put(&proxy, "people", "json", key.clone(), jsonb(&json!("a"))).await;

  let wrong = proxy
    .replace_mapping(Request::new(ReplaceMappingRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      previous_value: jsonb(&json!("zzz")),
      new_value: jsonb(&json!("b")),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(!wrong.value);

  let right = proxy
    .replace_mapping(Request::new(ReplaceMappingRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      previous_value: jsonb(&json!("a")),
      new_value: jsonb(&json!("b")),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(right.value);

  let removed = proxy
    .remove_mapping(Request::new(RemoveMappingRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: key.clone(),
      value: jsonb(&json!("b")),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(removed.value);
  assert!(!get(&proxy, "people", "json", key).await.present);
}

// =============================================================================
// Predicates
// =============================================================================

#[tokio::test]
async fn contains_checks() {
  let proxy = proxy();
  put(&proxy, "people", "json", jsonb(&json!("k")), jsonb(&json!(5))).await;

  let by_key = proxy
    .contains_key(Request::new(ContainsKeyRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(by_key.value);

  let entry_hit = proxy
    .contains_entry(Request::new(ContainsEntryRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
      value: jsonb(&json!(5)),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(entry_hit.value);

  let entry_miss = proxy
    .contains_entry(Request::new(ContainsEntryRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
      value: jsonb(&json!(6)),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(!entry_miss.value);

  let value_hit = proxy
    .contains_value(Request::new(ContainsValueRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      value: jsonb(&json!(5)),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(value_hit.value);

  let value_miss = proxy
    .contains_value(Request::new(ContainsValueRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      value: jsonb(&json!(99)),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(!value_miss.value);
}

#[tokio::test]
async fn size_and_emptiness() {
  let proxy = proxy();
  let empty = proxy
    .is_empty(Request::new(IsEmptyRequest {
      scope: String::new(),
      cache: "people".into(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(empty.value);

  put(&proxy, "people", "json", jsonb(&json!("a")), jsonb(&json!(1))).await;
  put(&proxy, "people", "json", jsonb(&json!("b")), jsonb(&json!(2))).await;

  let size = proxy
    .size(Request::new(SizeRequest {
      scope: String::new(),
      cache: "people".into(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(size.value, 2);

  let ready = proxy
    .is_ready(Request::new(IsReadyRequest {
      scope: String::new(),
      cache: "people".into(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(ready.value);
}

// =============================================================================
// Bulk operations
// =============================================================================

#[tokio::test]
async fn partitioned_put_all_issues_one_invocation_per_owner() {
  let (proxy, resolver) = proxy_with_resolver();

  let entries: Vec<Entry> = (0..6)
    .map(|i| {
      Entry::new(
        msgpack(&json!(format!("key-{}", i))),
        msgpack(&json!(i)),
      )
    })
    .collect();

  proxy
    .put_all(Request::new(PutAllRequest {
      scope: String::new(),
      cache: "bulk".into(),
      format: "msgpack".into(),
      entries: entries.clone(),
    }))
    .await
    .unwrap();

  let resolved = resolver.resolve("", "bulk").unwrap();
  let service = resolved.async_cache.service().clone();
  let owners: BTreeSet<Option<u32>> = entries
    .iter()
    .map(|e| service.owner_of(&resolved.cache, &e.key).map(|m| m.id))
    .collect();

  assert_eq!(
    resolved.cache.stats().bulk_invocations,
    owners.len() as u64
  );
  assert_eq!(resolved.cache.len(), 6);
}

#[tokio::test]
async fn get_all_streams_only_present_entries() {
  let proxy = proxy();
  put(&proxy, "people", "json", jsonb(&json!("a")), jsonb(&json!(1))).await;
  put(&proxy, "people", "json", jsonb(&json!("b")), jsonb(&json!(2))).await;

  let mut stream = proxy
    .get_all(Request::new(GetAllRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      keys: vec![
        jsonb(&json!("a")),
        jsonb(&json!("missing")),
        jsonb(&json!("b")),
      ],
    }))
    .await
    .unwrap()
    .into_inner();

  let mut seen = Vec::new();
  while let Some(entry) = stream.next().await {
    let entry = entry.unwrap();
    seen.push(serde_json::from_slice::<Value>(&entry.key).unwrap());
  }
  seen.sort_by_key(|v| v.as_str().unwrap().to_string());
  assert_eq!(seen, vec![json!("a"), json!("b")]);
}

#[tokio::test]
async fn get_all_with_no_keys_completes_immediately() {
  let proxy = proxy();
  let mut stream = proxy
    .get_all(Request::new(GetAllRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      keys: Vec::new(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(stream.next().await.is_none());
}

// =============================================================================
// Processors and aggregation
// =============================================================================

#[tokio::test]
async fn invoke_runs_a_processor_with_converted_payload() {
  let proxy = proxy();
  let processor = BinaryProcessor::Put {
    value: jsonb(&json!({"name": "sam"})),
    ttl_millis: 0,
  };

  let response = proxy
    .invoke(Request::new(InvokeRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
      processor: payload(jsonb, &processor),
    }))
    .await
    .unwrap()
    .into_inner();
  assert!(response.value.is_empty());

  let stored = get(&proxy, "people", "json", jsonb(&json!("k"))).await;
  assert!(stored.present);
  assert_eq!(
    serde_json::from_slice::<Value>(&stored.value).unwrap(),
    json!({"name": "sam"})
  );
}

#[tokio::test]
async fn invoke_without_processor_is_invalid() {
  let proxy = proxy();
  let err = proxy
    .invoke(Request::new(InvokeRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
      processor: Vec::new(),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn invoke_all_with_filter_streams_results() {
  let proxy = proxy();
  for (key, n) in [("a", 1), ("b", 5), ("c", 9)] {
    put(&proxy, "nums", "json", jsonb(&json!(key)), jsonb(&json!(n))).await;
  }

  let filter = Filter::Greater {
    extractor: Extractor::Identity,
    value: json!(2),
  };
  let mut stream = proxy
    .invoke_all(Request::new(InvokeAllRequest {
      scope: String::new(),
      cache: "nums".into(),
      format: "json".into(),
      keys: Vec::new(),
      filter: payload(jsonb, &filter),
      processor: payload(jsonb, &BinaryProcessor::Get),
    }))
    .await
    .unwrap()
    .into_inner();

  let mut keys = Vec::new();
  while let Some(entry) = stream.next().await {
    keys.push(serde_json::from_slice::<Value>(&entry.unwrap().key).unwrap());
  }
  keys.sort_by_key(|v| v.as_str().unwrap().to_string());
  assert_eq!(keys, vec![json!("b"), json!("c")]);
}

#[tokio::test]
async fn aggregate_count_and_sum() {
  let proxy = proxy();
  for (key, n) in [("a", 1), ("b", 2), ("c", 4)] {
    put(
      &proxy,
      "nums",
      "json",
      jsonb(&json!(key)),
      jsonb(&json!({ "n": n })),
    )
    .await;
  }

  let count = proxy
    .aggregate(Request::new(AggregateRequest {
      scope: String::new(),
      cache: "nums".into(),
      format: "json".into(),
      keys: Vec::new(),
      filter: Vec::new(),
      aggregator: payload(jsonb, &Aggregator::Count),
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(serde_json::from_slice::<Value>(&count.value).unwrap(), json!(3));

  let sum = proxy
    .aggregate(Request::new(AggregateRequest {
      scope: String::new(),
      cache: "nums".into(),
      format: "json".into(),
      keys: vec![jsonb(&json!("a")), jsonb(&json!("c"))],
      filter: Vec::new(),
      aggregator: payload(jsonb, &Aggregator::Sum(Extractor::Path("n".into()))),
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(serde_json::from_slice::<Value>(&sum.value).unwrap(), json!(5));
}

#[tokio::test]
async fn aggregate_without_aggregator_is_invalid() {
  let proxy = proxy();
  let err = proxy
    .aggregate(Request::new(AggregateRequest {
      scope: String::new(),
      cache: "nums".into(),
      format: "json".into(),
      keys: Vec::new(),
      filter: Vec::new(),
      aggregator: Vec::new(),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::InvalidArgument);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn entry_set_with_comparator_is_sorted() {
  let proxy = proxy();
  for (key, n) in [("x", 3), ("y", 1), ("z", 2)] {
    put(
      &proxy,
      "sorted",
      "json",
      jsonb(&json!(key)),
      jsonb(&json!({ "n": n })),
    )
    .await;
  }

  let comparator = Comparator::By {
    extractor: Extractor::Path("n".into()),
    descending: false,
  };
  let mut stream = proxy
    .entry_set(Request::new(EntrySetRequest {
      scope: String::new(),
      cache: "sorted".into(),
      format: "json".into(),
      filter: Vec::new(),
      comparator: payload(jsonb, &comparator),
    }))
    .await
    .unwrap()
    .into_inner();

  let mut keys = Vec::new();
  while let Some(entry) = stream.next().await {
    keys.push(serde_json::from_slice::<Value>(&entry.unwrap().key).unwrap());
  }
  assert_eq!(keys, vec![json!("y"), json!("z"), json!("x")]);
}

#[tokio::test]
async fn key_set_honors_the_filter() {
  let proxy = proxy();
  for (key, n) in [("a", 1), ("b", 8)] {
    put(&proxy, "nums", "json", jsonb(&json!(key)), jsonb(&json!(n))).await;
  }

  let filter = Filter::Greater {
    extractor: Extractor::Identity,
    value: json!(5),
  };
  let mut stream = proxy
    .key_set(Request::new(KeySetRequest {
      scope: String::new(),
      cache: "nums".into(),
      format: "json".into(),
      filter: payload(jsonb, &filter),
    }))
    .await
    .unwrap()
    .into_inner();

  let mut keys = Vec::new();
  while let Some(key) = stream.next().await {
    keys.push(serde_json::from_slice::<Value>(&key.unwrap().value).unwrap());
  }
  assert_eq!(keys, vec![json!("b")]);
}

// =============================================================================
// Paged iteration
// =============================================================================

#[tokio::test]
async fn paged_key_iteration_covers_every_key_once() {
  let proxy = proxy();
  let mut expected = BTreeSet::new();
  for i in 0..200 {
    let key = json!(format!("key-{:04}", i));
    expected.insert(key.to_string());
    put(&proxy, "paged", "json", jsonb(&key), jsonb(&json!(i))).await;
  }

  let mut seen = Vec::new();
  let mut cookie = Vec::new();
  let mut pages = 0;
  loop {
    let mut stream = proxy
      .next_key_set_page(Request::new(PageRequest {
        scope: String::new(),
        cache: "paged".into(),
        format: "json".into(),
        cookie: cookie.clone(),
      }))
      .await
      .unwrap()
      .into_inner();

    // the first element of each page is the next-page cookie
    cookie = stream.next().await.unwrap().unwrap().value;
    pages += 1;
    while let Some(key) = stream.next().await {
      seen.push(
        serde_json::from_slice::<Value>(&key.unwrap().value)
          .unwrap()
          .to_string(),
      );
    }
    if cookie.is_empty() {
      break;
    }
  }

  assert!(pages > 1, "expected multiple pages, got {}", pages);
  assert_eq!(seen.len(), 200, "every key exactly once");
  assert_eq!(seen.iter().cloned().collect::<BTreeSet<_>>(), expected);
}

#[tokio::test]
async fn paged_entry_iteration_carries_cookie_on_first_result() {
  let proxy = proxy();
  for i in 0..50 {
    put(
      &proxy,
      "paged-entries",
      "json",
      jsonb(&json!(format!("key-{:04}", i))),
      jsonb(&json!({ "n": i, "pad": "xxxxxxxxxxxxxxxx" })),
    )
    .await;
  }

  let mut stream = proxy
    .next_entry_set_page(Request::new(PageRequest {
      scope: String::new(),
      cache: "paged-entries".into(),
      format: "json".into(),
      cookie: Vec::new(),
    }))
    .await
    .unwrap()
    .into_inner();

  let first = stream.next().await.unwrap().unwrap();
  assert!(!first.cookie.is_empty(), "first result carries the cookie");
  let mut rest = 0;
  while let Some(result) = stream.next().await {
    assert!(result.unwrap().cookie.is_empty());
    rest += 1;
  }
  assert!(rest > 0);
}

// =============================================================================
// Errors and lifecycle
// =============================================================================

#[tokio::test]
async fn empty_cache_name_is_invalid_argument() {
  let proxy = proxy();
  let err = proxy
    .get(Request::new(GetRequest {
      scope: String::new(),
      cache: String::new(),
      format: "json".into(),
      key: jsonb(&json!("k")),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn unknown_scope_is_not_found() {
  let proxy = proxy();
  let err = proxy
    .get(Request::new(GetRequest {
      scope: "nope".into(),
      cache: "people".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn unknown_format_is_invalid_argument() {
  let proxy = proxy();
  let err = proxy
    .get(Request::new(GetRequest {
      scope: String::new(),
      cache: "people".into(),
      format: "pof".into(),
      key: vec![0x01],
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn operations_after_destroy_fail_precondition() {
  let proxy = proxy();
  put(&proxy, "doomed", "json", jsonb(&json!("k")), jsonb(&json!(1))).await;

  proxy
    .destroy(Request::new(DestroyRequest {
      scope: String::new(),
      cache: "doomed".into(),
    }))
    .await
    .unwrap();

  let err = proxy
    .get(Request::new(GetRequest {
      scope: String::new(),
      cache: "doomed".into(),
      format: "json".into(),
      key: jsonb(&json!("k")),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::FailedPrecondition);

  let err = proxy
    .size(Request::new(SizeRequest {
      scope: String::new(),
      cache: "doomed".into(),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn clear_and_truncate_empty_the_cache() {
  let proxy = proxy();
  put(&proxy, "wipe", "json", jsonb(&json!("a")), jsonb(&json!(1))).await;
  put(&proxy, "wipe", "json", jsonb(&json!("b")), jsonb(&json!(2))).await;

  proxy
    .clear(Request::new(ClearRequest {
      scope: String::new(),
      cache: "wipe".into(),
    }))
    .await
    .unwrap();
  let size = proxy
    .size(Request::new(SizeRequest {
      scope: String::new(),
      cache: "wipe".into(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(size.value, 0);

  put(&proxy, "wipe", "json", jsonb(&json!("c")), jsonb(&json!(3))).await;
  proxy
    .truncate(Request::new(TruncateRequest {
      scope: String::new(),
      cache: "wipe".into(),
    }))
    .await
    .unwrap();
  let size = proxy
    .size(Request::new(SizeRequest {
      scope: String::new(),
      cache: "wipe".into(),
    }))
    .await
    .unwrap()
    .into_inner();
  assert_eq!(size.value, 0);
}

#[tokio::test]
async fn index_registration_through_the_proxy() {
  let (proxy, resolver) = proxy_with_resolver();
  let extractor = Extractor::Path("age".into());

  proxy
    .add_index(Request::new(AddIndexRequest {
      scope: String::new(),
      cache: "indexed".into(),
      format: "json".into(),
      extractor: payload(jsonb, &extractor),
      sorted: true,
      comparator: Vec::new(),
    }))
    .await
    .unwrap();

  let resolved = resolver.resolve("", "indexed").unwrap();
  assert_eq!(resolved.cache.index_count(), 1);

  proxy
    .remove_index(Request::new(RemoveIndexRequest {
      scope: String::new(),
      cache: "indexed".into(),
      format: "json".into(),
      extractor: payload(jsonb, &extractor),
    }))
    .await
    .unwrap();
  assert_eq!(resolved.cache.index_count(), 0);

  // an absent extractor payload is rejected before touching the cache
  let err = proxy
    .add_index(Request::new(AddIndexRequest {
      scope: String::new(),
      cache: "indexed".into(),
      format: "json".into(),
      extractor: Vec::new(),
      sorted: false,
      comparator: Vec::new(),
    }))
    .await
    .unwrap_err();
  assert_eq!(err.code(), Code::InvalidArgument);
}
