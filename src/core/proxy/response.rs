//! Outbound response assembly.
//!
//! Every response the proxy writes, streamed or not, carries the same
//! base header set: the `Via` tag used for loop detection, the
//! security headers, the request id echo, and any operator-configured
//! extras. Error replies mirror the plain-text shape clients of the
//! original deployment expect: `<message>\n` with nosniff.

use crate::config::Config;
use crate::core::proxy::service::RequestCtx;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use chrono::{Months, Utc};
use pingora::Result;
use pingora::http::ResponseHeader;
use pingora::proxy::Session;

/// Embedded fallback favicon, PNG.
pub const FAVICON_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAEAAAABACAYAAACqaXHeAAAABmJLR0QA/wD/AP+gvaeTAAAFBElEQVR4nO1aO2xcRRQ9d2bXBoIlikWJZKFQUaAoLlxAAcLaROaTNRKfLSLLEcgdNe7dRZS4QojOyMJV5MIr2tR0UGwTCVAoFu9GiAJkK7tzKfa99fvMfbtzs34ueKdJNKuZe+fM3HNm5hmoUKFChQoVKlSoUKFChRmwtsu1y85BwtpaeG4mtMPjPwYrr20Pvgjtd9HYunOyff3KYCW0XzABdQCGee/G5/1WaN+LwubGk3UA32j6BhMAAMSwzDi4ce/Pm5r+88Tm+09eN250SAxVaYYT8HTciYAlItNZuTdY1gSeBz774OSaMa5DjJcM68bQ7gAQAwZYJvDRza3eFV14Pdrtx88PDR4Q83UCQADqT8PHUWlAHJAYIGC1DvtDu802PLwOu7tsFv5d/N44vEkATLQgGgQTMCT3CnEU9Dx46/fFwX1dCuF49NPgK8P4eLIIUS5D5quhYwUTQGRfjANO/h3/f+eNzYu3x607J9vE/KXBpAzPc6nhhdDxVBqQCp5YAcO899bmxdljbHeTuEjpETQ1GEyAFDxqs3A4ePvu/O0xaXeULr9JLnYUPm74DhglgiNdClFCS4ZNp9menz1m7S5bfnGbBsEEWKRZT4khJu3LbPlofQ726LO75K5LEqKBagekygB+Qshh1Z0+mz1KducR4PI0ILkDTFYDOLNCQOtvp7dHye4yFlyuBlikBTClAcgTYgg7730abo+Fdgc/IRqoj8JxQsaTUI4Q5r2Nj2a3x2l2JxGigY4A5CecE8P0ClkABx9+Mt0eZ7E7LyFc4jkgV/soEMPz35esM512S7bHWe1OEkOUogFO9H8vIckVAmPZWT7aWs/bY4jdSYRooNcAwY6mEULA6ulzaXsMtTuf3pQugoUrlBXDbBujVTs7t8dQu8uJYdSm0YDgZ6QFFK9GkTtMJgQADjt3Nwa/1Zw7Q6DdSWKokADFO9rIs+WFhOPEFkbcGxqyBLycmpDjr+Hv3x8Z/GNHeNVHiHD8VtWB2gbFFc7WPgN1R39ZS+8Qo5fWDq557K5vrLs1JPQlu5MIKec2KASfJoaHDxpdOGoaoDduY1//vrHu1reda78AntpPjO8rv9LuAtPsLqfOkUUdHje6hqlJ4J6nf9+YzOQxRQwTuahWUkMAksEL7E46oe0fN7oE0yRE5RCtPMC348nHiUl2JzlOeQQIyfnsyqdL+8eNriPTJEaPgD6Bb3/349WffTGk5zefGJb6JDar3Unbc/+40TXgd32TBwB4xC5HSOZ3zaeh4D7SdbjIv8n5x/JOPI5TYHc+Qko9CUp2J58MwwvUN+FCMSzLBbwHoUIxZGi+2xXVviSGGqifxGbxf4q8XrU9XWZMyITE5VfOk9gou8ISIZw++ysSm+m1KfF7Ke8BgKcGs6vBnPs9FEV2lyMkilv6l6Gs3Ul2pUFKVzCFEJSoAfAklCaEc4RogqS0RRDYLCEa6EUwEzwleh53CEWR3UliWI4NQrY70R2Eg1ARZjn7X8plyPdlKGl3WXd4ltqU7O5yL0MZf07ZnbBCVrMDINudRIgG4XeB0TiqZHcpd0i0haLI7kQLLuOPpLLJzfKYqToHuOLLkO/4rYH+IOSxuyJCdDEyK+wT2AQhGgSXwKKpP3LurEtu3DleKRufxiIiLAPGjdsWHD8MjeOIH55aGscYAYYSV2QCOIrBNM6BABiiX0PjVKhQoUKF/zP+A5KXL3I9XEqCAAAAAElFTkSuQmCC";

/// Sets the headers present on every outbound response, before any
/// status-specific ones.
pub fn apply_base_headers(
    header: &mut ResponseHeader,
    config: &Config,
    request_id: &str,
) -> Result<()> {
    header.insert_header("Via", config.server_name.as_str())?;
    header.insert_header(
        "Content-Security-Policy",
        format!("default-src {}", config.csp_origin),
    )?;
    header.insert_header(
        "Strict-Transport-Security",
        "max-age=63072000; includeSubDomains",
    )?;
    if !request_id.is_empty() {
        header.insert_header("X-Request-ID", request_id)?;
    }
    if config.disable_keepalives_fe {
        header.insert_header("Connection", "close")?;
    }
    for (name, value) in &config.add_response_headers {
        header.insert_header(name.clone(), value.as_str())?;
    }
    Ok(())
}

/// Writes a plain-text error reply: message plus trailing newline,
/// nosniff, never cached by shape.
pub async fn serve_error(
    session: &mut Session,
    config: &Config,
    ctx: &mut RequestCtx,
    status: u16,
    message: &str,
    extra_headers: &[(&str, &str)],
) -> Result<bool> {
    let body = format!("{message}\n");
    let mut header = ResponseHeader::build(status, None)?;
    apply_base_headers(&mut header, config, &ctx.request_id)?;
    header.insert_header("Content-Type", "text/plain; charset=utf-8")?;
    header.insert_header("X-Content-Type-Options", "nosniff")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    for (name, value) in extra_headers {
        header.insert_header(name.to_string(), *value)?;
    }

    ctx.response_bytes = body.len() as u64;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(Bytes::from(body)), true)
        .await?;
    Ok(true)
}

/// Load-balancer health sidepath.
pub async fn serve_health(
    session: &mut Session,
    config: &Config,
    ctx: &mut RequestCtx,
) -> Result<bool> {
    let body = "OK\n";
    let mut header = ResponseHeader::build(200, None)?;
    apply_base_headers(&mut header, config, &ctx.request_id)?;
    header.insert_header("Content-Type", "text/plain; charset=utf-8")?;
    header.insert_header("Content-Length", body.len().to_string())?;

    ctx.response_bytes = body.len() as u64;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(Bytes::from_static(body.as_bytes())), true)
        .await?;
    Ok(true)
}

/// Embedded favicon sidepath, cacheable for a month.
pub async fn serve_favicon(
    session: &mut Session,
    config: &Config,
    ctx: &mut RequestCtx,
    icon: &Bytes,
) -> Result<bool> {
    let expires = Utc::now()
        .checked_add_months(Months::new(1))
        .unwrap_or_else(Utc::now)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    let mut header = ResponseHeader::build(200, None)?;
    apply_base_headers(&mut header, config, &ctx.request_id)?;
    header.insert_header("Content-Type", "image/png")?;
    header.insert_header("Content-Length", icon.len().to_string())?;
    header.insert_header("Expires", expires)?;

    ctx.response_bytes = icon.len() as u64;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(icon.clone()), true)
        .await?;
    Ok(true)
}

/// Decodes the embedded favicon once at service construction.
///
/// # Panics
///
/// Panics if the embedded blob is corrupt (build error, not runtime).
#[must_use]
pub fn favicon_bytes() -> Bytes {
    Bytes::from(
        STANDARD
            .decode(FAVICON_B64)
            .expect("embedded favicon is valid base64"),
    )
}
