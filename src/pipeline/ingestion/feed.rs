use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::domain::Timestamp;
use crate::error::{PipelineError, Result};
use crate::observability::metrics;

const RECORD_TAG: &str = "Imovel";
const PHOTO_TAG: &str = "Foto";
const PHOTO_URL_TAGS: &[&str] = &["URLArquivo", "URL"];

/// One listing as read from the external feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub external_id: String,
    pub reference: String,
    pub property_type: String,
    pub category: String,
    pub for_sale: bool,
    pub for_rent: bool,
    pub seasonal: bool,
    pub sale_price: Option<f64>,
    pub rental_price: Option<f64>,
    pub seasonal_price: Option<f64>,
    pub condo_fee: Option<f64>,
    pub iptu: Option<f64>,
    pub bedrooms: u32,
    pub bathrooms: u32,
    pub suites: u32,
    pub parking_spaces: u32,
    pub built_area: f64,
    pub total_area: f64,
    pub street: String,
    pub number: String,
    pub complement: String,
    pub neighborhood: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub title: String,
    pub description: String,
    pub captured_by: String,
    pub updated_at: Option<Timestamp>,
    pub photo_urls: Vec<String>,
}

/// Leaf values of one `<Imovel>` element, keyed by element name
#[derive(Debug, Default)]
struct RawRecord {
    fields: HashMap<String, String>,
    photos: Vec<String>,
}

impl RawRecord {
    fn text(&self, tag: &str) -> String {
        self.fields.get(tag).cloned().unwrap_or_default()
    }

    fn decimal(&self, tag: &str) -> Option<f64> {
        let raw = self.fields.get(tag)?;
        if raw.trim().is_empty() {
            return None;
        }
        let parsed = parse_decimal(raw);
        if parsed.is_none() {
            warn!("Unreadable numeric value {:?} in <{}>, ignoring", raw, tag);
        }
        parsed
    }

    fn count(&self, tag: &str) -> u32 {
        self.decimal(tag).map(|v| v.max(0.0).round() as u32).unwrap_or(0)
    }

    fn flag(&self, tag: &str) -> bool {
        self.fields.get(tag).map(|v| parse_flag(v)).unwrap_or(false)
    }

    fn into_record(self) -> FeedRecord {
        let updated_at = self
            .fields
            .get("DataAtualizacao")
            .filter(|v| !v.trim().is_empty())
            .map(|v| Timestamp::parse(v));

        FeedRecord {
            external_id: self.text("CodigoImovel"),
            reference: self.text("Referencia"),
            property_type: self.text("TipoImovel"),
            category: self.text("Categoria"),
            for_sale: self.flag("Venda"),
            for_rent: self.flag("Locacao"),
            seasonal: self.flag("Temporada"),
            sale_price: self.decimal("PrecoVenda"),
            rental_price: self.decimal("PrecoLocacao"),
            seasonal_price: self.decimal("PrecoTemporada"),
            condo_fee: self.decimal("ValorCondominio"),
            iptu: self.decimal("ValorIPTU"),
            bedrooms: self.count("Dormitorios"),
            bathrooms: self.count("Banheiros"),
            suites: self.count("Suites"),
            parking_spaces: self.count("Vagas"),
            built_area: self.decimal("AreaUtil").unwrap_or(0.0),
            total_area: self.decimal("AreaTotal").unwrap_or(0.0),
            street: self.text("Endereco"),
            number: self.text("Numero"),
            complement: self.text("Complemento"),
            neighborhood: self.text("Bairro"),
            city: self.text("Cidade"),
            state: self.text("UF"),
            zip_code: self.text("CEP"),
            latitude: self.decimal("Latitude"),
            longitude: self.decimal("Longitude"),
            title: self.text("TituloImovel"),
            description: self.text("Observacao"),
            captured_by: self.text("CaptadoPor"),
            updated_at,
            photo_urls: self.photos,
        }
    }
}

/// Parse the whole feed. Any well-formedness problem rejects the entire
/// document; no partial record list is ever returned.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<FeedRecord>> {
    let started = std::time::Instant::now();
    match parse_feed_inner(bytes) {
        Ok(records) => {
            metrics::feed::parse_success(records.len(), started.elapsed().as_secs_f64());
            info!("📄 Parsed {} feed records ({} bytes)", records.len(), bytes.len());
            Ok(records)
        }
        Err(e) => {
            metrics::feed::parse_error();
            Err(e)
        }
    }
}

fn parse_feed_inner(bytes: &[u8]) -> Result<Vec<FeedRecord>> {
    // Text is split around entity references, so trimming happens per leaf
    // value rather than per text event.
    let mut reader = Reader::from_reader(bytes);

    let mut records = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut saw_root = false;

    let mut current: Option<RawRecord> = None;
    let mut record_depth = 0usize;
    let mut text = String::new();
    let mut has_children = false;
    let mut photo_url_seen = false;

    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            PipelineError::FeedMalformed(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;

        match event {
            Event::Start(ref e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                saw_root = true;
                if name == RECORD_TAG && current.is_none() {
                    current = Some(RawRecord::default());
                    record_depth = stack.len() + 1;
                }
                if name == PHOTO_TAG {
                    photo_url_seen = false;
                }
                stack.push(name);
                text.clear();
                has_children = false;
            }
            Event::Empty(ref e) => {
                saw_root = true;
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if let Some(record) = current.as_mut() {
                    record.fields.entry(name).or_default();
                } else if name == RECORD_TAG {
                    debug!("Skipping empty <{}/> at byte {}", RECORD_TAG, reader.buffer_position());
                }
                has_children = true;
            }
            Event::Text(ref e) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Event::CData(ref e) => {
                text.push_str(&String::from_utf8_lossy(e.as_ref()));
            }
            Event::GeneralRef(ref e) => {
                let name = String::from_utf8_lossy(e.as_ref()).to_string();
                match resolve_entity(&name) {
                    Some(resolved) => text.push_str(&resolved),
                    None => {
                        return Err(PipelineError::FeedMalformed(format!(
                            "unknown entity &{}; at byte {}",
                            name,
                            reader.buffer_position()
                        )))
                    }
                }
            }
            Event::End(_) => {
                let name = stack.pop().ok_or_else(|| {
                    PipelineError::FeedMalformed("closing tag without an open element".to_string())
                })?;
                let leaf = !has_children;
                let parent_is_photo = stack.last().map(|p| p == PHOTO_TAG).unwrap_or(false);

                let closes_record =
                    current.is_some() && name == RECORD_TAG && stack.len() + 1 == record_depth;
                if closes_record {
                    if let Some(done) = current.take() {
                        let parsed = done.into_record();
                        debug!("Parsed feed record {} / {}", parsed.external_id, parsed.reference);
                        records.push(parsed);
                    }
                } else if let Some(record) = current.as_mut() {
                    let value = text.trim().to_string();
                    if parent_is_photo && PHOTO_URL_TAGS.contains(&name.as_str()) {
                        if !value.is_empty() {
                            record.photos.push(value);
                        }
                        photo_url_seen = true;
                    } else if name == PHOTO_TAG {
                        if !photo_url_seen && leaf && !value.is_empty() {
                            record.photos.push(value);
                        }
                    } else if leaf && !parent_is_photo {
                        record.fields.entry(name).or_insert(value);
                    }
                }

                text.clear();
                has_children = true;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(PipelineError::FeedMalformed("document has no root element".to_string()));
    }
    if !stack.is_empty() {
        return Err(PipelineError::FeedMalformed(format!(
            "unexpected end of document inside <{}>",
            stack.join("/")
        )));
    }

    Ok(records)
}

fn resolve_entity(name: &str) -> Option<String> {
    match name {
        "amp" => Some("&".to_string()),
        "lt" => Some("<".to_string()),
        "gt" => Some(">".to_string()),
        "quot" => Some("\"".to_string()),
        "apos" => Some("'".to_string()),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse::<u32>().ok()
            } else {
                None
            };
            code.and_then(char::from_u32).map(|c| c.to_string())
        }
    }
}

/// Parse a decimal that may use either `.` or `,` as the decimal separator,
/// with optional thousands separators and currency prefix.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // A lone comma is the Brazilian decimal separator
        (Some(_), None) if cleaned.matches(',').count() > 1 && groups_thousands(&cleaned, ',') => {
            cleaned.replace(',', "")
        }
        (Some(_), None) => cleaned.replace(',', "."),
        (None, Some(_)) if groups_thousands(&cleaned, '.') => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// True when `sep` can only be a thousands separator: it appears more than
/// once, or once with exactly three digits after it ("450.000", "1.200").
fn groups_thousands(value: &str, sep: char) -> bool {
    let digits = value.strip_prefix('-').unwrap_or(value);
    let mut groups = digits.split(sep);
    let head = groups.next().unwrap_or_default();
    let tail: Vec<&str> = groups.collect();
    let well_formed = !head.is_empty()
        && head.len() <= 3
        && head.chars().all(|c| c.is_ascii_digit())
        && tail.iter().all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()));
    well_formed && (tail.len() > 1 || head != "0")
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "sim" | "s" | "yes" | "y" | "x"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Carga>
  <Imoveis>
    <Imovel>
      <CodigoImovel>77749175</CodigoImovel>
      <Referencia>AP00335</Referencia>
      <TipoImovel>Apartamento</TipoImovel>
      <Venda>1</Venda>
      <Locacao>0</Locacao>
      <PrecoVenda>450.000,00</PrecoVenda>
      <Dormitorios>3</Dormitorios>
      <AreaTotal>80</AreaTotal>
      <Endereco>Rua A</Endereco>
      <Numero>100</Numero>
      <Bairro>Centro</Bairro>
      <Cidade>SP</Cidade>
      <Observacao><![CDATA[Sol da manhã & vista]]></Observacao>
      <TituloImovel>Apto &amp; garagem</TituloImovel>
      <DataAtualizacao>10/03/2024 08:15</DataAtualizacao>
      <Fotos>
        <Foto><URLArquivo>http://cdn.example.com/1.jpg</URLArquivo></Foto>
        <Foto><URL>http://cdn.example.com/2.jpg</URL></Foto>
        <Foto>http://cdn.example.com/3.jpg</Foto>
      </Fotos>
    </Imovel>
    <Imovel>
      <CodigoImovel>88</CodigoImovel>
      <Referencia>CA00001</Referencia>
      <TipoImovel>Casa</TipoImovel>
      <Locacao>sim</Locacao>
      <AreaTotal>abc</AreaTotal>
      <Latitude/>
    </Imovel>
  </Imoveis>
</Carga>"#;

    #[test]
    fn test_parses_records_in_order() {
        let records = parse_feed(FEED.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.external_id, "77749175");
        assert_eq!(first.reference, "AP00335");
        assert!(first.for_sale);
        assert!(!first.for_rent);
        assert_eq!(first.sale_price, Some(450_000.0));
        assert_eq!(first.bedrooms, 3);
        assert_eq!(first.total_area, 80.0);
        assert_eq!(first.title, "Apto & garagem");
        assert_eq!(first.description, "Sol da manhã & vista");
        assert!(first.updated_at.as_ref().and_then(|t| t.as_datetime()).is_some());
        assert_eq!(
            first.photo_urls,
            vec![
                "http://cdn.example.com/1.jpg",
                "http://cdn.example.com/2.jpg",
                "http://cdn.example.com/3.jpg"
            ]
        );

        let second = &records[1];
        assert_eq!(second.reference, "CA00001");
        assert!(second.for_rent);
        assert_eq!(second.total_area, 0.0);
        assert_eq!(second.latitude, None);
        assert!(second.photo_urls.is_empty());
    }

    #[test]
    fn test_truncated_feed_is_rejected_whole() {
        let truncated = &FEED[..FEED.find("<Imovel>\n      <CodigoImovel>88").unwrap() + 40];
        let err = parse_feed(truncated.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::FeedMalformed(_)));
    }

    #[test]
    fn test_mismatched_tags_are_rejected() {
        let bad = "<Imoveis><Imovel><Referencia>X</Cidade></Imovel></Imoveis>";
        assert!(matches!(parse_feed(bad.as_bytes()), Err(PipelineError::FeedMalformed(_))));
    }

    #[test]
    fn test_empty_input_is_rejected() {
        assert!(matches!(parse_feed(b""), Err(PipelineError::FeedMalformed(_))));
        assert!(matches!(parse_feed(b"   "), Err(PipelineError::FeedMalformed(_))));
    }

    #[test]
    fn test_feed_without_records_is_valid() {
        let records = parse_feed(b"<Carga><Imoveis/></Carga>").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_parse_decimal_separators() {
        assert_eq!(parse_decimal("80"), Some(80.0));
        assert_eq!(parse_decimal("80,5"), Some(80.5));
        assert_eq!(parse_decimal("1.234,56"), Some(1234.56));
        assert_eq!(parse_decimal("1,234.56"), Some(1234.56));
        assert_eq!(parse_decimal("R$ 2.500,00"), Some(2500.0));
        assert_eq!(parse_decimal("1.5"), Some(1.5));
        assert_eq!(parse_decimal("80.25"), Some(80.25));
        assert_eq!(parse_decimal("0.500"), Some(0.5));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("n/a"), None);
    }

    #[test]
    fn test_dot_grouped_thousands() {
        assert_eq!(parse_decimal("450.000"), Some(450_000.0));
        assert_eq!(parse_decimal("1.200"), Some(1200.0));
        assert_eq!(parse_decimal("R$ 1.500.000"), Some(1_500_000.0));
        assert_eq!(parse_decimal("1,500,000"), Some(1_500_000.0));
        assert_eq!(parse_decimal("-2.000"), Some(-2000.0));
        assert_eq!(parse_decimal("80,500"), Some(80.5));
    }

    #[test]
    fn test_grouped_area_keeps_fingerprint_inputs_stable() {
        let feed = "<Carga><Imovel><CodigoImovel>9</CodigoImovel>\
                    <PrecoVenda>450.000</PrecoVenda><AreaTotal>1.200</AreaTotal></Imovel></Carga>";
        let records = parse_feed(feed.as_bytes()).unwrap();
        assert_eq!(records[0].sale_price, Some(450_000.0));
        assert_eq!(records[0].total_area, 1200.0);
    }

    #[test]
    fn test_self_closing_record_is_skipped() {
        let records = parse_feed(b"<Carga><Imovel/><Imovel><CodigoImovel>1</CodigoImovel></Imovel></Carga>").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "1");
    }
}
