// This file is part of flowindex.
// Copyright (C) 2025 Flowindex Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use indexer_common::domain::Address;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use thiserror::Error;

/// A decoded Cadence value: the JSON-Cadence payload is a recursively tagged structure,
/// represented once as this tree which processors then pattern-match on. Numeric values are
/// preserved as decimal strings to avoid precision loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CadenceValue {
    Void,
    Bool(bool),
    String(String),
    Number(String),
    Address(Address),
    Optional(Option<Box<CadenceValue>>),
    Array(Vec<CadenceValue>),
    Dictionary(Vec<(CadenceValue, CadenceValue)>),
    /// Struct, Resource or Event: named fields.
    Composite(BTreeMap<String, CadenceValue>),
    Path(String),
    Type(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CadenceDecodeError {
    #[error("JSON-Cadence value is not an object")]
    NotAnObject,

    #[error("JSON-Cadence value has no type tag")]
    MissingType,

    #[error("malformed {0} value")]
    Malformed(String),
}

impl CadenceValue {
    /// Decode a JSON-Cadence document into the tagged tree.
    pub fn decode(json: &Json) -> Result<Self, CadenceDecodeError> {
        let object = json.as_object().ok_or(CadenceDecodeError::NotAnObject)?;
        let type_tag = object
            .get("type")
            .and_then(Json::as_str)
            .ok_or(CadenceDecodeError::MissingType)?;
        let value = object.get("value");

        let malformed = || CadenceDecodeError::Malformed(type_tag.to_string());

        match type_tag {
            "Void" => Ok(CadenceValue::Void),

            "Bool" => value
                .and_then(Json::as_bool)
                .map(CadenceValue::Bool)
                .ok_or_else(malformed),

            "String" | "Character" => value
                .and_then(Json::as_str)
                .map(|s| CadenceValue::String(s.to_string()))
                .ok_or_else(malformed),

            "Address" => value
                .and_then(Json::as_str)
                .map(|s| CadenceValue::Address(Address::normalize(s)))
                .ok_or_else(malformed),

            "Optional" => match value {
                None | Some(Json::Null) => Ok(CadenceValue::Optional(None)),
                Some(inner) => Ok(CadenceValue::Optional(Some(Box::new(Self::decode(inner)?)))),
            },

            "Array" => {
                let items = value.and_then(Json::as_array).ok_or_else(malformed)?;
                let items = items.iter().map(Self::decode).collect::<Result<_, _>>()?;
                Ok(CadenceValue::Array(items))
            }

            "Dictionary" => {
                let pairs = value.and_then(Json::as_array).ok_or_else(malformed)?;
                let pairs = pairs
                    .iter()
                    .map(|pair| {
                        let key = pair.get("key").ok_or_else(malformed)?;
                        let value = pair.get("value").ok_or_else(malformed)?;
                        Ok((Self::decode(key)?, Self::decode(value)?))
                    })
                    .collect::<Result<_, CadenceDecodeError>>()?;
                Ok(CadenceValue::Dictionary(pairs))
            }

            "Struct" | "Resource" | "Event" | "Contract" | "Enum" => {
                let fields = value
                    .and_then(|v| v.get("fields"))
                    .and_then(Json::as_array)
                    .ok_or_else(malformed)?;
                let fields = fields
                    .iter()
                    .map(|field| {
                        let name = field
                            .get("name")
                            .and_then(Json::as_str)
                            .ok_or_else(malformed)?;
                        let value = field.get("value").ok_or_else(malformed)?;
                        Ok((name.to_string(), Self::decode(value)?))
                    })
                    .collect::<Result<_, CadenceDecodeError>>()?;
                Ok(CadenceValue::Composite(fields))
            }

            "Path" => {
                let domain = value
                    .and_then(|v| v.get("domain"))
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?;
                let identifier = value
                    .and_then(|v| v.get("identifier"))
                    .and_then(Json::as_str)
                    .ok_or_else(malformed)?;
                Ok(CadenceValue::Path(format!("/{domain}/{identifier}")))
            }

            "Type" => {
                let type_id = value
                    .and_then(|v| v.get("staticType"))
                    .map(|t| match t {
                        Json::String(s) => s.clone(),
                        other => other
                            .get("typeID")
                            .and_then(Json::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .ok_or_else(malformed)?;
                Ok(CadenceValue::Type(type_id))
            }

            // All remaining tags are the numeric family (Int*, UInt*, Word*, Fix64, UFix64);
            // values arrive as decimal strings and stay that way.
            _ => value
                .and_then(Json::as_str)
                .map(|s| CadenceValue::Number(s.to_string()))
                .ok_or_else(malformed),
        }
    }

    /// Look up a named field of a composite, unwrapping one level of `Optional`.
    pub fn field(&self, name: &str) -> Option<&CadenceValue> {
        match self {
            CadenceValue::Composite(fields) => match fields.get(name) {
                Some(CadenceValue::Optional(Some(inner))) => Some(inner),
                Some(CadenceValue::Optional(None)) => None,
                other => other,
            },
            _ => None,
        }
    }

    /// The string form of a scalar leaf: strings, numbers and addresses.
    pub fn as_string(&self) -> Option<String> {
        match self {
            CadenceValue::String(s) | CadenceValue::Number(s) => Some(s.clone()),
            CadenceValue::Address(address) => Some(address.as_str().to_string()),
            _ => None,
        }
    }

    /// The address form of a leaf, normalizing plain strings as well.
    pub fn as_address(&self) -> Option<Address> {
        match self {
            CadenceValue::Address(address) => Some(address.clone()),
            CadenceValue::String(s) => Some(Address::normalize(s)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_event_payload() {
        let payload = json!({
            "type": "Event",
            "value": {
                "id": "A.7e60df042a9c0868.FlowToken.TokensWithdrawn",
                "fields": [
                    { "name": "amount", "value": { "type": "UFix64", "value": "1.50000000" } },
                    {
                        "name": "from",
                        "value": {
                            "type": "Optional",
                            "value": { "type": "Address", "value": "0xabc" }
                        }
                    }
                ]
            }
        });

        let value = CadenceValue::decode(&payload).unwrap();
        assert_eq!(
            value.field("amount").and_then(CadenceValue::as_string),
            Some("1.50000000".to_string())
        );
        assert_eq!(
            value.field("from").and_then(CadenceValue::as_address),
            Some(Address::normalize("0xabc"))
        );
    }

    #[test]
    fn test_decode_optional_null() {
        let payload = json!({ "type": "Optional", "value": null });
        assert_eq!(CadenceValue::decode(&payload), Ok(CadenceValue::Optional(None)));
    }

    #[test]
    fn test_decode_dictionary() {
        let payload = json!({
            "type": "Dictionary",
            "value": [
                {
                    "key": { "type": "String", "value": "k" },
                    "value": { "type": "UInt64", "value": "42" }
                }
            ]
        });

        let value = CadenceValue::decode(&payload).unwrap();
        assert_eq!(
            value,
            CadenceValue::Dictionary(vec![(
                CadenceValue::String("k".to_string()),
                CadenceValue::Number("42".to_string())
            )])
        );
    }

    #[test]
    fn test_decode_malformed() {
        use assert_matches::assert_matches;

        let payload = json!({ "value": "no type tag" });
        assert_matches!(
            CadenceValue::decode(&payload),
            Err(CadenceDecodeError::MissingType)
        );
        assert_matches!(
            CadenceValue::decode(&json!("scalar")),
            Err(CadenceDecodeError::NotAnObject)
        );
        assert_matches!(
            CadenceValue::decode(&json!({ "type": "Array", "value": 42 })),
            Err(CadenceDecodeError::Malformed(tag)) if tag == "Array"
        );
    }
}
