/*!
# Powermon DevKit - Doublures de test pour le collecteur

Bibliothèque facilitant les tests du collecteur sans matériel ni serveur:
- Lien série scripté qui répond comme un compteur PZEM
- Constructeur de trames de réponse (CRC inclus)
- Faux serveur d'ingestion HTTP (axum) avec modes de panne
- Harness câblant un service complet avec des timings courts
*/

pub mod ingest_stub;
pub mod serial_stub;
pub mod test_utils;

pub use ingest_stub::{IngestMode, MockIngestServer, RecordedRequest};
pub use serial_stub::{MeterFrameBuilder, MockSerialLink};
pub use test_utils::TestHarness;
