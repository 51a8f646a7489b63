use mediapipe_llm_bridge::{Handle, RequestId, SamplingSettings};

/// Key of the model location inside a create payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateKind {
    Reference,
    Asset,
}

/// Parses `model=<ref>;max_tokens=..;top_k=..;temperature=..;seed=..`.
/// A payload without any `=` is taken as the bare location.
pub(crate) fn parse_create_payload(
    payload: &str,
    kind: CreateKind,
    base: SamplingSettings,
) -> Result<(String, SamplingSettings), String> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err("create payload is empty. Use key=value pairs separated by ';'".to_string());
    }
    if !payload.contains('=') {
        return Ok((payload.to_string(), base));
    }

    let mut location: Option<String> = None;
    let mut settings = base;

    for pair in payload.split([';', '\n']) {
        let item = pair.trim();
        if item.is_empty() {
            continue;
        }

        let mut it = item.splitn(2, '=');
        let key = it.next().unwrap_or("").trim().to_lowercase();
        let value = it
            .next()
            .ok_or_else(|| format!("Invalid item '{}'. Expected key=value", item))?
            .trim();

        match (key.as_str(), kind) {
            ("model" | "path" | "uri", CreateKind::Reference) | ("asset" | "name", CreateKind::Asset) => {
                location = Some(value.to_string());
            }
            ("max_tokens" | "maxtokens", _) => {
                settings.max_tokens = value
                    .parse()
                    .map_err(|_| format!("Invalid max_tokens '{}'.", value))?;
            }
            ("top_k" | "topk", _) => {
                settings.top_k = value
                    .parse()
                    .map_err(|_| format!("Invalid top_k '{}'.", value))?;
            }
            ("temperature" | "temp", _) => {
                settings.temperature = value
                    .parse()
                    .map_err(|_| format!("Invalid temperature '{}'.", value))?;
            }
            ("seed" | "random_seed" | "randomseed", _) => {
                settings.random_seed = value
                    .parse()
                    .map_err(|_| format!("Invalid seed '{}'.", value))?;
            }
            _ => return Err(format!("Unknown create key '{}'.", key)),
        }
    }

    let location = location.filter(|l| !l.is_empty()).ok_or_else(|| match kind {
        CreateKind::Reference => "missing 'model=<path>' entry".to_string(),
        CreateKind::Asset => "missing 'asset=<name>' entry".to_string(),
    })?;
    Ok((location, settings))
}

pub(crate) fn parse_handle(raw: &str) -> Result<Handle, String> {
    raw.trim()
        .parse::<u64>()
        .map(Handle)
        .map_err(|_| format!("Invalid handle '{}'.", raw.trim()))
}

/// `<handle>` or `<handle>/<request_id>`.
pub(crate) fn parse_generate_target(target: &str) -> Result<(Handle, Option<RequestId>), String> {
    match target.split_once('/') {
        Some((handle, request_id)) => {
            let handle = parse_handle(handle)?;
            let request_id = RequestId::parse(request_id)
                .ok_or_else(|| format!("Empty request id in target '{}'.", target))?;
            Ok((handle, Some(request_id)))
        }
        None => Ok((parse_handle(target)?, None)),
    }
}

pub(crate) fn parse_size_mb(payload: &str) -> Result<u64, String> {
    let text = payload.trim();
    let digits = text
        .strip_suffix("MB")
        .or_else(|| text.strip_suffix("mb"))
        .unwrap_or(text)
        .trim();
    digits
        .parse::<u64>()
        .map_err(|_| format!("Invalid model size '{}'. Expected megabytes", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_payload_overrides_defaults() {
        let (location, settings) = parse_create_payload(
            "model=/models/gemma.task; max_tokens=256; top_k=20; temperature=0.5; seed=7",
            CreateKind::Reference,
            SamplingSettings::default(),
        )
        .expect("valid payload");
        assert_eq!(location, "/models/gemma.task");
        assert_eq!(settings.max_tokens, 256);
        assert_eq!(settings.top_k, 20);
        assert_eq!(settings.temperature, 0.5);
        assert_eq!(settings.random_seed, 7);
    }

    #[test]
    fn bare_location_keeps_defaults() {
        let (location, settings) =
            parse_create_payload("gemma.task\n", CreateKind::Asset, SamplingSettings::default())
                .expect("valid payload");
        assert_eq!(location, "gemma.task");
        assert_eq!(settings, SamplingSettings::default());
    }

    #[test]
    fn create_payload_rejects_wrong_location_key() {
        let err = parse_create_payload(
            "asset=gemma.task",
            CreateKind::Reference,
            SamplingSettings::default(),
        )
        .expect_err("asset key is not valid for CREATE");
        assert!(err.contains("Unknown create key"));

        let err = parse_create_payload("top_k=3", CreateKind::Asset, SamplingSettings::default())
            .expect_err("missing location");
        assert!(err.contains("asset=<name>"));
    }

    #[test]
    fn generate_target_forms() {
        assert_eq!(parse_generate_target("3"), Ok((Handle(3), None)));
        assert_eq!(
            parse_generate_target("3/17"),
            Ok((Handle(3), Some(RequestId::Number(17))))
        );
        assert_eq!(
            parse_generate_target("3/chat-a"),
            Ok((Handle(3), Some(RequestId::Text("chat-a".to_string()))))
        );
        assert!(parse_generate_target("x/1").is_err());
        assert!(parse_generate_target("3/").is_err());
    }

    #[test]
    fn size_accepts_optional_unit() {
        assert_eq!(parse_size_mb("400"), Ok(400));
        assert_eq!(parse_size_mb(" 1200MB "), Ok(1200));
        assert!(parse_size_mb("big").is_err());
    }
}
