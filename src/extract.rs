//! Market data extraction from decoded parameter trees.
//!
//! Two shapes matter. Market orders travel as JSON strings embedded inside
//! the decoded value tree (sometimes nested one JSON level deeper, so the
//! scan re-parses strings it finds inside JSON too). Price history travels as
//! three index-aligned arrays in a correlated response.
use serde_json::Value as Json;
use tracing::trace;

use crate::record::{MarketHistoryRecord, MarketOrderRecord};
use crate::value::{ParameterTree, Value};

/// Recursion ceiling for the order scan, counted across both the value tree
/// and re-parsed embedded JSON. The live protocol nests two or three levels;
/// anything deeper is malformed or adversarial.
const MAX_SCAN_DEPTH: u32 = 8;

const PARAM_HISTORY_ITEM_AMOUNTS: u8 = 0;
const PARAM_HISTORY_SILVER_AMOUNTS: u8 = 1;
const PARAM_HISTORY_TIMESTAMPS: u8 = 2;

/// Walk a parameter tree and capture every market-order shaped JSON object.
pub fn scan_orders(params: &ParameterTree) -> Vec<MarketOrderRecord> {
    let mut out = Vec::new();
    for value in params.values() {
        scan_value(value, 0, &mut out);
    }
    out
}

fn scan_value(value: &Value, depth: u32, out: &mut Vec<MarketOrderRecord>) {
    if depth > MAX_SCAN_DEPTH {
        trace!(depth, "order scan depth bound hit");
        return;
    }
    match value {
        Value::Str(s) => {
            // Embedded structured payloads are JSON; everything else is plain
            // text and ignored.
            if let Ok(json) = serde_json::from_str::<Json>(s) {
                scan_json(&json, depth + 1, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_value(item, depth + 1, out);
            }
        }
        Value::Map(pairs) => {
            for (k, v) in pairs {
                scan_value(k, depth + 1, out);
                scan_value(v, depth + 1, out);
            }
        }
        _ => {}
    }
}

fn scan_json(json: &Json, depth: u32, out: &mut Vec<MarketOrderRecord>) {
    if depth > MAX_SCAN_DEPTH {
        trace!(depth, "order scan depth bound hit");
        return;
    }
    match json {
        Json::Object(obj) => {
            if let Some(order) = order_from_json(json) {
                out.push(order);
                return;
            }
            for v in obj.values() {
                scan_json(v, depth + 1, out);
            }
        }
        Json::Array(items) => {
            for item in items {
                scan_json(item, depth + 1, out);
            }
        }
        // JSON strings can themselves hold serialized JSON one level down.
        Json::String(s) => {
            if let Ok(nested) = serde_json::from_str::<Json>(s) {
                scan_json(&nested, depth + 1, out);
            }
        }
        _ => {}
    }
}

fn json_i64(v: &Json) -> Option<i64> {
    match v {
        Json::Number(n) => n.as_i64(),
        // Prices occasionally arrive stringified.
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A JSON object carrying both `ItemTypeId` and `UnitPriceSilver` is a
/// market order.
fn order_from_json(json: &Json) -> Option<MarketOrderRecord> {
    let obj = json.as_object()?;
    let item_key = obj.get("ItemTypeId")?.as_str()?.to_string();
    let price = json_i64(obj.get("UnitPriceSilver")?)?;

    Some(MarketOrderRecord {
        order_id: obj.get("Id").and_then(json_i64),
        item_key,
        auction_type: obj
            .get("AuctionType")
            .and_then(Json::as_str)
            .map(str::to_string),
        location_id: obj.get("LocationId").and_then(json_i64),
        quality: obj.get("QualityLevel").and_then(json_i64),
        enchantment: obj.get("EnchantmentLevel").and_then(json_i64),
        price,
        amount: obj.get("Amount").and_then(json_i64).unwrap_or(0),
        expires: obj.get("Expires").and_then(Json::as_str).map(str::to_string),
        raw: json.clone(),
    })
}

fn int_array(params: &ParameterTree, id: u8, wrap: bool) -> Vec<i64> {
    let Some(Value::Array(items)) = params.get(&id) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|v| if wrap { v.as_wrapped_i64() } else { v.as_i64() })
        .collect()
}

/// Zip a correlated history response into normalized records.
///
/// Item amounts get the signed-byte unsigned-wrap correction; arrays of
/// unequal length zip to the shortest.
pub fn parse_history(
    params: &ParameterTree,
    item_key: &str,
    quality: i64,
    timescale: i64,
    location_id: i64,
) -> Vec<MarketHistoryRecord> {
    let item_amounts = int_array(params, PARAM_HISTORY_ITEM_AMOUNTS, true);
    let silver_amounts = int_array(params, PARAM_HISTORY_SILVER_AMOUNTS, false);
    let timestamps = int_array(params, PARAM_HISTORY_TIMESTAMPS, false);

    let n = item_amounts.len().min(silver_amounts.len()).min(timestamps.len());
    (0..n)
        .map(|i| MarketHistoryRecord {
            item_key: item_key.to_string(),
            quality,
            location_id,
            timestamp: timestamps[i],
            aggregation_type: timescale,
            item_amount: item_amounts[i],
            silver_amount: silver_amounts[i],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(entries: Vec<(u8, Value)>) -> ParameterTree {
        entries.into_iter().collect()
    }

    #[test]
    fn captures_order_from_embedded_json() {
        let params = tree(vec![(
            0,
            Value::Str(
                r#"{"Id":99,"ItemTypeId":"T4_BAG","UnitPriceSilver":50000,"Amount":3,"LocationId":3005,"QualityLevel":2,"EnchantmentLevel":1,"AuctionType":"offer","Expires":"2026-09-01T00:00:00"}"#
                    .into(),
            ),
        )]);
        let orders = scan_orders(&params);
        assert_eq!(orders.len(), 1);
        let o = &orders[0];
        assert_eq!(o.order_id, Some(99));
        assert_eq!(o.item_key, "T4_BAG");
        assert_eq!(o.price, 50_000);
        assert_eq!(o.amount, 3);
        assert_eq!(o.location_id, Some(3005));
        assert_eq!(o.quality, Some(2));
        assert_eq!(o.enchantment, Some(1));
        assert_eq!(o.auction_type.as_deref(), Some("offer"));
    }

    #[test]
    fn scans_arrays_of_json_strings() {
        let params = tree(vec![(
            0,
            Value::Array(vec![
                Value::Str(r#"{"ItemTypeId":"T4_BAG","UnitPriceSilver":100,"Amount":1}"#.into()),
                Value::Str("not json at all".into()),
                Value::Str(r#"{"ItemTypeId":"T5_BAG","UnitPriceSilver":200,"Amount":2}"#.into()),
            ]),
        )]);
        let orders = scan_orders(&params);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].item_key, "T4_BAG");
        assert_eq!(orders[1].item_key, "T5_BAG");
    }

    #[test]
    fn rewalks_json_nested_inside_json() {
        // An outer JSON object whose field holds another serialized order.
        let inner = r#"{\"ItemTypeId\":\"T6_BAG\",\"UnitPriceSilver\":999,\"Amount\":1}"#;
        let outer = format!(r#"{{"Payload":"{inner}"}}"#);
        let params = tree(vec![(0, Value::Str(outer))]);
        let orders = scan_orders(&params);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].item_key, "T6_BAG");
        assert_eq!(orders[0].price, 999);
    }

    #[test]
    fn depth_bound_stops_pathological_nesting() {
        // A JSON string wrapped in itself well past the bound.
        let mut s = r#"{"ItemTypeId":"T4_BAG","UnitPriceSilver":1}"#.to_string();
        for _ in 0..(MAX_SCAN_DEPTH + 4) {
            s = serde_json::to_string(&Json::String(s)).unwrap();
        }
        let params = tree(vec![(0, Value::Str(s))]);
        assert!(scan_orders(&params).is_empty());
    }

    #[test]
    fn non_order_json_is_ignored() {
        let params = tree(vec![
            (0, Value::Str(r#"{"Hello":"World"}"#.into())),
            (1, Value::Str(r#"{"ItemTypeId":"T4_BAG"}"#.into())), // no price
        ]);
        assert!(scan_orders(&params).is_empty());
    }

    #[test]
    fn history_zips_three_arrays() {
        let params = tree(vec![
            (0, Value::Array(vec![Value::Int8(-5), Value::Int8(3)])),
            (1, Value::Array(vec![Value::Int32(1000), Value::Int32(600)])),
            (
                2,
                Value::Array(vec![
                    Value::Int64(1_700_000_000),
                    Value::Int64(1_700_003_600),
                ]),
            ),
        ]);
        let records = parse_history(&params, "T4_BAG", 1, 24, 3005);
        assert_eq!(records.len(), 2);
        // Item amount -5 wraps to 251.
        assert_eq!(records[0].item_amount, 251);
        assert_eq!(records[0].silver_amount, 1000);
        assert_eq!(records[0].timestamp, 1_700_000_000);
        assert_eq!(records[0].aggregation_type, 24);
        assert_eq!(records[1].item_amount, 3);
        assert_eq!(records[1].location_id, 3005);
        assert_eq!(records[1].quality, 1);
    }

    #[test]
    fn history_unequal_arrays_zip_to_shortest() {
        let params = tree(vec![
            (0, Value::Array(vec![Value::Int8(1), Value::Int8(2), Value::Int8(3)])),
            (1, Value::Array(vec![Value::Int32(10)])),
            (2, Value::Array(vec![Value::Int64(100), Value::Int64(200)])),
        ]);
        let records = parse_history(&params, "T4_BAG", 1, 0, 0);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn history_missing_arrays_yield_nothing() {
        let params = tree(vec![(0, Value::Array(vec![Value::Int8(1)]))]);
        assert!(parse_history(&params, "T4_BAG", 1, 0, 0).is_empty());
    }
}
