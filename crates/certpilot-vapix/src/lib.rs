// # VAPIX Certificate Installer
//
// This crate pushes certificates issued by the engine onto an Axis device
// and activates them for the device's HTTPS server.
//
// ## Install Sequence
//
// 1. Read `<certs>/certificates/<domain>.crt` and `.key`
// 2. Canonicalise the private key to PKCS#8 (the device rejects SEC1/PKCS#1)
// 3. `LoadCertificateWithPrivateKey` under a fresh `lego-` identifier
// 4. Read the supported cipher list from `param.cgi`
// 5. `SetWebServerTlsConfiguration` pointing HTTPS at the new identifier
// 6. Best-effort: delete every other `lego-` identifier
//
// Steps 3 to 5 abort the install on failure. Step 6 never does.
//
// ## Security
//
// - The device password NEVER appears in logs or Debug output
// - Requests use HTTP basic auth with a 30 second timeout
//
// ## API Reference
//
// - ONVIF Device Management: `LoadCertificateWithPrivateKey`,
//   `GetCertificates`, `DeleteCertificates`
// - VAPIX Web Server API: `SetWebServerTlsConfiguration`
// - VAPIX Parameter API: `GET /axis-cgi/param.cgi?action=list&group=HTTPS.Ciphers`

pub mod cert_id;
pub mod client;
pub mod installer;
pub mod keys;
pub mod soap;

pub use client::DeviceClient;
pub use installer::VapixInstaller;
