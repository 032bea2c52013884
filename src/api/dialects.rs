//! Inbound dialect translation.
//!
//! The router core speaks OpenAI chat completions. Clients talking the
//! Anthropic Messages dialect (`POST /v1/messages`) or the Gemini dialect
//! (`POST /v1beta/models/{model}:generateContent`) get translated into the
//! canonical shape on the way in and back out on the way back — the routing
//! pipeline itself never sees a foreign schema.

use serde_json::{json, Value};

use crate::error::RouterError;

// ──────────────────────────────────────────────────────────────────────────────
// Anthropic Messages dialect
// ──────────────────────────────────────────────────────────────────────────────

/// Translate an Anthropic Messages request body into the canonical OpenAI shape.
pub fn anthropic_request_to_openai(body: &Value) -> Result<Value, RouterError> {
    let model = body["model"]
        .as_str()
        .ok_or_else(|| RouterError::InvalidRequest("`model` is required".into()))?;
    let raw_messages = body["messages"]
        .as_array()
        .ok_or_else(|| RouterError::InvalidRequest("`messages` must be an array".into()))?;

    let mut messages: Vec<Value> = Vec::new();

    // Anthropic's top-level system field becomes a leading system message.
    match &body["system"] {
        Value::String(text) => messages.push(json!({ "role": "system", "content": text })),
        Value::Array(blocks) => {
            let text: String = blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            if !text.is_empty() {
                messages.push(json!({ "role": "system", "content": text }));
            }
        }
        _ => {}
    }

    for msg in raw_messages {
        let role = msg["role"].as_str().unwrap_or("user");
        match &msg["content"] {
            Value::String(text) => messages.push(json!({ "role": role, "content": text })),
            Value::Array(blocks) => translate_anthropic_blocks(role, blocks, &mut messages),
            _ => {}
        }
    }

    let mut out = json!({ "model": model, "messages": messages });
    if let Some(max) = body["max_tokens"].as_u64() {
        out["max_tokens"] = json!(max);
    }
    if let Some(temp) = body["temperature"].as_f64() {
        out["temperature"] = json!(temp);
    }
    if let Some(top_p) = body["top_p"].as_f64() {
        out["top_p"] = json!(top_p);
    }
    if let Some(stop) = body["stop_sequences"].as_array() {
        out["stop"] = json!(stop);
    }
    if let Some(stream) = body["stream"].as_bool() {
        out["stream"] = json!(stream);
    }
    if let Some(tools) = body["tools"].as_array() {
        let translated: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t["name"],
                        "description": t["description"],
                        "parameters": t["input_schema"],
                    },
                })
            })
            .collect();
        if !translated.is_empty() {
            out["tools"] = Value::Array(translated);
        }
    }

    Ok(out)
}

fn translate_anthropic_blocks(role: &str, blocks: &[Value], messages: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block["type"].as_str() {
            Some("text") => parts.push(json!({ "type": "text", "text": block["text"] })),
            Some("image") => {
                if block.pointer("/source/type") == Some(&json!("base64")) {
                    let mime = block.pointer("/source/media_type").and_then(Value::as_str);
                    let data = block.pointer("/source/data").and_then(Value::as_str);
                    if let (Some(mime), Some(data)) = (mime, data) {
                        parts.push(json!({
                            "type": "image_url",
                            "image_url": { "url": format!("data:{mime};base64,{data}") },
                        }));
                    }
                }
            }
            Some("tool_use") => tool_calls.push(json!({
                "id": block["id"],
                "type": "function",
                "function": {
                    "name": block["name"],
                    "arguments": block["input"].to_string(),
                },
            })),
            Some("tool_result") => messages.push(json!({
                "role": "tool",
                "tool_call_id": block["tool_use_id"],
                "content": block["content"],
            })),
            _ => {}
        }
    }

    if !tool_calls.is_empty() {
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        let content = if text.is_empty() { Value::Null } else { Value::String(text) };
        messages.push(json!({ "role": role, "content": content, "tool_calls": tool_calls }));
    } else if !parts.is_empty() {
        messages.push(json!({ "role": role, "content": parts }));
    }
}

/// Translate a canonical OpenAI response back into the Anthropic shape.
pub fn openai_response_to_anthropic(resp: &Value) -> Value {
    let message = &resp["choices"][0]["message"];
    let mut content: Vec<Value> = Vec::new();

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(json!({ "type": "text", "text": text }));
        }
    }
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        let input: Value = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .and_then(|a| serde_json::from_str(a).ok())
            .unwrap_or_else(|| json!({}));
        content.push(json!({
            "type": "tool_use",
            "id": call["id"],
            "name": call.pointer("/function/name"),
            "input": input,
        }));
    }

    let stop_reason = match resp["choices"][0]["finish_reason"].as_str() {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    };

    json!({
        "id": resp["id"],
        "type": "message",
        "role": "assistant",
        "model": resp["model"],
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": resp.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": resp.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
        },
        "smart_ai_router": resp["smart_ai_router"],
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Gemini dialect
// ──────────────────────────────────────────────────────────────────────────────

/// Translate a Gemini `generateContent` request body into the canonical shape.
/// The model comes from the URL path, not the body.
pub fn gemini_request_to_openai(model: &str, body: &Value) -> Result<Value, RouterError> {
    let contents = body["contents"]
        .as_array()
        .ok_or_else(|| RouterError::InvalidRequest("`contents` must be an array".into()))?;

    let mut messages: Vec<Value> = Vec::new();

    if let Some(parts) = body.pointer("/systemInstruction/parts").and_then(Value::as_array) {
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for content in contents {
        let role = match content["role"].as_str() {
            Some("model") => "assistant",
            _ => "user",
        };
        let parts = content["parts"].as_array().cloned().unwrap_or_default();

        let mut text_parts: Vec<Value> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if let Some(text) = part["text"].as_str() {
                text_parts.push(json!({ "type": "text", "text": text }));
            } else if let Some(inline) = part.get("inline_data").or_else(|| part.get("inlineData")) {
                let mime = inline.pointer("/mime_type").or_else(|| inline.pointer("/mimeType"));
                if let (Some(mime), Some(data)) =
                    (mime.and_then(Value::as_str), inline["data"].as_str())
                {
                    text_parts.push(json!({
                        "type": "image_url",
                        "image_url": { "url": format!("data:{mime};base64,{data}") },
                    }));
                }
            } else if let Some(call) = part.get("functionCall") {
                tool_calls.push(json!({
                    "id": format!("call_{i}"),
                    "type": "function",
                    "function": {
                        "name": call["name"],
                        "arguments": call["args"].to_string(),
                    },
                }));
            } else if let Some(response) = part.get("functionResponse") {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": format!("call_{}", response["name"].as_str().unwrap_or("fn")),
                    "content": response["response"].to_string(),
                }));
            }
        }

        if !tool_calls.is_empty() {
            messages.push(json!({ "role": role, "content": null, "tool_calls": tool_calls }));
        } else if text_parts.len() == 1 && text_parts[0]["type"] == "text" {
            messages.push(json!({ "role": role, "content": text_parts[0]["text"] }));
        } else if !text_parts.is_empty() {
            messages.push(json!({ "role": role, "content": text_parts }));
        }
    }

    let mut out = json!({ "model": model, "messages": messages });

    if let Some(max) = body.pointer("/generationConfig/maxOutputTokens").and_then(Value::as_u64) {
        out["max_tokens"] = json!(max);
    }
    if let Some(temp) = body.pointer("/generationConfig/temperature").and_then(Value::as_f64) {
        out["temperature"] = json!(temp);
    }
    if let Some(top_p) = body.pointer("/generationConfig/topP").and_then(Value::as_f64) {
        out["top_p"] = json!(top_p);
    }
    if let Some(stop) = body.pointer("/generationConfig/stopSequences") {
        out["stop"] = stop.clone();
    }
    if let Some(declarations) = body.pointer("/tools/0/functionDeclarations").and_then(Value::as_array)
    {
        let tools: Vec<Value> = declarations
            .iter()
            .map(|d| {
                json!({
                    "type": "function",
                    "function": {
                        "name": d["name"],
                        "description": d["description"],
                        "parameters": d["parameters"],
                    },
                })
            })
            .collect();
        out["tools"] = Value::Array(tools);
    }

    Ok(out)
}

/// Translate a canonical OpenAI response back into the Gemini shape.
pub fn openai_response_to_gemini(resp: &Value) -> Value {
    let message = &resp["choices"][0]["message"];
    let mut parts: Vec<Value> = Vec::new();

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
    }
    for call in message["tool_calls"].as_array().into_iter().flatten() {
        let args: Value = call
            .pointer("/function/arguments")
            .and_then(Value::as_str)
            .and_then(|a| serde_json::from_str(a).ok())
            .unwrap_or_else(|| json!({}));
        parts.push(json!({
            "functionCall": { "name": call.pointer("/function/name"), "args": args },
        }));
    }

    let finish_reason = match resp["choices"][0]["finish_reason"].as_str() {
        Some("length") => "MAX_TOKENS",
        Some("content_filter") => "SAFETY",
        _ => "STOP",
    };

    json!({
        "candidates": [{
            "content": { "role": "model", "parts": parts },
            "finishReason": finish_reason,
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": resp.pointer("/usage/prompt_tokens").cloned().unwrap_or(json!(0)),
            "candidatesTokenCount": resp.pointer("/usage/completion_tokens").cloned().unwrap_or(json!(0)),
            "totalTokenCount": resp.pointer("/usage/total_tokens").cloned().unwrap_or(json!(0)),
        },
        "smart_ai_router": resp["smart_ai_router"],
    })
}
