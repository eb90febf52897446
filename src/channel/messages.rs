use serde::{Deserialize, Serialize};

// Module for deserializing integer amounts the backend may send as strings
pub mod string_or_u64 {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StringOrU64;

        impl<'de> serde::de::Visitor<'de> for StringOrU64 {
            type Value = u64;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an unsigned integer or a string containing one")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse::<u64>().map_err(serde::de::Error::custom)
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_str(&value)
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(value)
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(value).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(StringOrU64)
    }
}

/// Quote request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteParams {
    pub user_pubkey: String,
    pub input_mint: String,
    pub output_mint: String,
    pub amount_in: u64,
    pub slippage_bps: u16,
}

/// The route token echoed back verbatim to the build step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEcho {
    pub provider: String,
    pub serialized_quote: String,
}

/// Build-swap request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSwapParams {
    pub user_pubkey: String,
    pub quote: RouteEcho,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrap_and_unwrap_sol: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_legacy_transaction: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_token_account: Option<String>,
}

/// Credentials payload for the auth reply. Exactly one of the three modes
/// is populated.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_base64: Option<String>,
}

/// Outbound messages to the trading backend
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth(AuthPayload),
    Quote { params: QuoteParams },
    BuildSwapTx { params: BuildSwapParams },
}

/// Wallet-signature challenge offered by the server hello
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletSigChallenge {
    pub challenge: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    #[serde(default)]
    pub wallet_sig: Option<WalletSigChallenge>,
}

/// Route data as the backend reports it. `serialized_quote` is optional
/// here so its absence can be detected and refused downstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRouteData {
    pub provider: String,
    #[serde(default)]
    pub hops: Option<u32>,
    #[serde(default)]
    pub serialized_quote: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResultData {
    #[serde(with = "string_or_u64")]
    pub amount_in: u64,
    #[serde(with = "string_or_u64")]
    pub amount_out: u64,
    #[serde(with = "string_or_u64")]
    pub min_out: u64,
    #[serde(default)]
    pub price_impact_bps: i64,
    #[serde(default)]
    pub route: Option<QuoteRouteData>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSwapTxResultData {
    #[serde(default)]
    pub transaction_base64: Option<String>,
    #[serde(default)]
    pub swap_transaction: Option<String>,
    #[serde(default)]
    pub recent_blockhash: Option<String>,
    #[serde(default)]
    pub last_valid_block_height: Option<u64>,
}

impl BuildSwapTxResultData {
    /// The transaction blob under either contract key, if present and
    /// non-empty.
    pub fn transaction_blob(&self) -> Option<&str> {
        self.transaction_base64
            .as_deref()
            .or(self.swap_transaction.as_deref())
            .filter(|blob| !blob.is_empty())
    }
}

/// Inbound messages from the trading backend. Anything outside the
/// documented contract lands in `Unrecognized`; it is counted and logged,
/// never passed through as valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        auth: Option<HelloAuth>,
    },
    AuthResult {
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    QuoteResult {
        success: bool,
        #[serde(default)]
        data: Option<QuoteResultData>,
        #[serde(default)]
        error: Option<String>,
    },
    BuildSwapTxResult {
        success: bool,
        #[serde(default)]
        data: Option<BuildSwapTxResultData>,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unrecognized,
}

impl ServerMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::AuthResult { .. } => "auth_result",
            ServerMessage::QuoteResult { .. } => "quote_result",
            ServerMessage::BuildSwapTxResult { .. } => "build_swap_tx_result",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Unrecognized => "unrecognized",
        }
    }
}

/// Parse one inbound text frame. Malformed frames become `Unrecognized`
/// instead of an error so a hostile backend cannot wedge the read loop.
pub fn parse_server_message(text: &str) -> ServerMessage {
    serde_json::from_str(text).unwrap_or(ServerMessage::Unrecognized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quote_result_with_string_amounts() {
        let raw = r#"{
            "type": "quote_result",
            "success": true,
            "data": {
                "amountIn": "10000000",
                "amountOut": 123456789,
                "minOut": "122222221",
                "priceImpactBps": 35,
                "route": {"provider": "jupiter", "hops": 2, "serializedQuote": "opaque-blob"}
            }
        }"#;

        let msg = parse_server_message(raw);
        match msg {
            ServerMessage::QuoteResult { success, data, .. } => {
                assert!(success);
                let data = data.unwrap();
                assert_eq!(data.amount_in, 10_000_000);
                assert_eq!(data.amount_out, 123_456_789);
                assert_eq!(data.min_out, 122_222_221);
                assert_eq!(
                    data.route.unwrap().serialized_quote.as_deref(),
                    Some("opaque-blob")
                );
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_unrecognized_not_an_error() {
        let msg = parse_server_message(r#"{"type": "surprise", "payload": 1}"#);
        assert!(matches!(msg, ServerMessage::Unrecognized));

        let msg = parse_server_message("not json at all");
        assert!(matches!(msg, ServerMessage::Unrecognized));
    }

    #[test]
    fn auth_reply_serializes_only_the_active_mode() {
        let msg = ClientMessage::Auth(AuthPayload {
            api_key: Some("key-123".to_string()),
            ..AuthPayload::default()
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "auth");
        assert_eq!(json["apiKey"], "key-123");
        assert!(json.get("jwt").is_none());
        assert!(json.get("wallet").is_none());
    }

    #[test]
    fn quote_request_matches_the_wire_contract() {
        let msg = ClientMessage::Quote {
            params: QuoteParams {
                user_pubkey: "user".to_string(),
                input_mint: "in".to_string(),
                output_mint: "out".to_string(),
                amount_in: 10_000_000,
                slippage_bps: 50,
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "quote");
        assert_eq!(json["params"]["userPubkey"], "user");
        assert_eq!(json["params"]["amountIn"], 10_000_000);
        assert_eq!(json["params"]["slippageBps"], 50);
    }

    #[test]
    fn build_result_blob_prefers_either_contract_key() {
        let with_new_key: BuildSwapTxResultData = serde_json::from_str(
            r#"{"transactionBase64": "dGVzdA==", "lastValidBlockHeight": 100}"#,
        )
        .unwrap();
        assert_eq!(with_new_key.transaction_blob(), Some("dGVzdA=="));

        let with_legacy_key: BuildSwapTxResultData =
            serde_json::from_str(r#"{"swapTransaction": "dGVzdA=="}"#).unwrap();
        assert_eq!(with_legacy_key.transaction_blob(), Some("dGVzdA=="));

        let empty: BuildSwapTxResultData =
            serde_json::from_str(r#"{"transactionBase64": ""}"#).unwrap();
        assert_eq!(empty.transaction_blob(), None);
    }
}
