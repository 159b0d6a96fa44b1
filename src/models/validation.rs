use reqwest::Url;

use crate::{Error, Result};

pub fn validate_not_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    validate_not_empty("tenant_id", tenant_id)?;

    if tenant_id.len() > 128 {
        return Err(Error::validation("tenant_id too long (maximum 128 characters)"));
    }

    let valid_chars = tenant_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.');

    if !valid_chars {
        return Err(Error::validation("tenant_id contains invalid characters"));
    }

    Ok(())
}

pub fn validate_email_address(address: &str) -> Result<()> {
    validate_not_empty("recipient", address)?;

    if address.len() > 254 {
        return Err(Error::validation("Email address too long (maximum 254 characters)"));
    }

    let Some((local, domain)) = address.split_once('@') else {
        return Err(Error::validation("Email address must contain '@'"));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(Error::validation("Email address is malformed"));
    }

    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(Error::validation("Email domain is malformed"));
    }

    if address.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
        return Err(Error::validation("Email address contains invalid characters"));
    }

    Ok(())
}

pub fn validate_phone_number(number: &str) -> Result<()> {
    validate_not_empty("recipient", number)?;

    let digits = number.strip_prefix('+').unwrap_or(number);

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::validation("Phone number must contain digits only"));
    }

    if digits.len() < 7 || digits.len() > 15 {
        return Err(Error::validation("Phone number must have 7 to 15 digits"));
    }

    Ok(())
}

pub fn validate_webhook_url(url: &str) -> Result<()> {
    validate_not_empty("url", url)?;

    let parsed = Url::parse(url).map_err(|e| Error::validation(format!("Invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::validation(format!(
                "Unsupported webhook scheme '{}'",
                other
            )));
        }
    }

    if parsed.host_str().is_none() {
        return Err(Error::validation("Webhook URL must have a host"));
    }

    Ok(())
}
