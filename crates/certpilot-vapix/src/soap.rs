//! SOAP request bodies and response scanning for the device web services
//!
//! The device accepts SOAP 1.2 envelopes on `/vapix/services`. Responses are
//! scanned textually for the few elements the installer needs; no general
//! XML parser is involved.

use certpilot_core::{Error, Result};

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope""#,
    r#" xmlns:tds="http://www.onvif.org/ver10/device/wsdl""#,
    r#" xmlns:tt="http://www.onvif.org/ver10/schema">"#,
    "<SOAP-ENV:Body>",
);

const ENVELOPE_CLOSE: &str = "</SOAP-ENV:Body></SOAP-ENV:Envelope>";

/// Wrap a request body in the SOAP envelope
pub fn envelope(body: &str) -> String {
    let mut out = String::with_capacity(ENVELOPE_OPEN.len() + body.len() + ENVELOPE_CLOSE.len());
    out.push_str(ENVELOPE_OPEN);
    out.push_str(body);
    out.push_str(ENVELOPE_CLOSE);
    out
}

/// Escape the five XML special characters
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Upload a certificate and private key under `id`
///
/// Both payloads are base64 DER.
pub fn load_certificate_body(id: &str, certificate_b64: &str, key_b64: &str) -> String {
    format!(
        concat!(
            r#"<tds:LoadCertificateWithPrivateKey xmlns="http://www.onvif.org/ver10/device/wsdl">"#,
            "<CertificateWithPrivateKey>",
            "<tt:CertificateID>{id}</tt:CertificateID>",
            "<tt:Certificate><tt:Data>{cert}</tt:Data></tt:Certificate>",
            "<tt:PrivateKey><tt:Data>{key}</tt:Data></tt:PrivateKey>",
            "</CertificateWithPrivateKey>",
            "</tds:LoadCertificateWithPrivateKey>",
        ),
        id = xml_escape(id),
        cert = certificate_b64,
        key = key_b64,
    )
}

/// Activate `id` as the HTTPS certificate, restricted to `ciphers`
///
/// Blank cipher names are skipped.
pub fn set_tls_configuration_body(id: &str, ciphers: &[String]) -> String {
    let cipher_elements: String = ciphers
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| format!("<acert:Cipher>{}</acert:Cipher>", xml_escape(c)))
        .collect();

    format!(
        concat!(
            r#"<SetWebServerTlsConfiguration xmlns="http://www.axis.com/vapix/ws/webserver""#,
            r#" xmlns:acert="http://www.axis.com/vapix/ws/cert">"#,
            "<Configuration>",
            "<Tls>true</Tls>",
            "<ConnectionPolicies><Admin>HttpAndHttps</Admin></ConnectionPolicies>",
            "<Ciphers>{ciphers}</Ciphers>",
            "<CertificateSet>",
            "<acert:Certificates><acert:Id>{id}</acert:Id></acert:Certificates>",
            "<acert:CACertificates></acert:CACertificates>",
            "<acert:TrustedCertificates></acert:TrustedCertificates>",
            "</CertificateSet>",
            "</Configuration>",
            "</SetWebServerTlsConfiguration>",
        ),
        ciphers = cipher_elements,
        id = xml_escape(id),
    )
}

/// List every installed certificate
pub fn get_certificates_body() -> &'static str {
    r#"<tds:GetCertificates xmlns="http://www.onvif.org/ver10/device/wsdl"/>"#
}

/// Delete the certificate stored under `id`
pub fn delete_certificate_body(id: &str) -> String {
    format!(
        concat!(
            r#"<tds:DeleteCertificates xmlns="http://www.onvif.org/ver10/device/wsdl">"#,
            "<CertificateID>{}</CertificateID>",
            "</tds:DeleteCertificates>",
        ),
        xml_escape(id)
    )
}

/// Classify a SOAP response
///
/// A body mentioning `Fault` is a protocol fault whatever the status code;
/// otherwise any status other than 200 is an error.
pub fn check_response(status: u16, body: &str) -> Result<()> {
    if body.contains("Fault") {
        return Err(Error::protocol_fault(fault_message(body)));
    }
    if status != 200 {
        return Err(Error::HttpStatus { status });
    }
    Ok(())
}

/// Reason text of a fault, with its detail appended when present
pub fn fault_message(body: &str) -> String {
    let reason = extract_soap_text(body, "Reason");
    let detail = extract_soap_text(body, "Detail");

    let mut message = reason.unwrap_or_else(|| "SOAP fault".to_string());
    if let Some(detail) = detail {
        message.push_str(": ");
        message.push_str(&detail);
    }
    message
}

/// Text of the first `SOAP-ENV:Text` inside `<SOAP-ENV:{element}>`
///
/// Returns `None` when the element or its text is missing or blank.
pub fn extract_soap_text(body: &str, element: &str) -> Option<String> {
    let open = format!("<SOAP-ENV:{element}>");
    let after_element = &body[body.find(&open)? + open.len()..];

    let text_start = after_element.find("<SOAP-ENV:Text")?;
    let after_tag = &after_element[text_start..];
    let content = &after_tag[after_tag.find('>')? + 1..];
    let end = content.find("</SOAP-ENV:Text>")?;

    let text = content[..end].trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Every non-blank `<tt:CertificateID>` value, in document order
pub fn extract_certificate_ids(body: &str) -> Vec<String> {
    const OPEN: &str = "<tt:CertificateID>";
    const CLOSE: &str = "</tt:CertificateID>";

    let mut ids = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(OPEN) {
        rest = &rest[start + OPEN.len()..];
        let Some(end) = rest.find(CLOSE) else {
            break;
        };
        let id = rest[..end].trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
        rest = &rest[end + CLOSE.len()..];
    }
    ids
}

/// Parse `root.HTTPS.Ciphers=A:B:C` into its cipher names
pub fn parse_ciphers(body: &str) -> Result<Vec<String>> {
    let line = body.trim();
    let (_, list) = line
        .split_once('=')
        .ok_or_else(|| Error::parse(format!("unexpected cipher response: {line}")))?;

    Ok(list
        .split(':')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect())
}
