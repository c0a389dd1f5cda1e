//! Typed view of a `GET /product/get/{sku}` payload.
//!
//! The client hands back raw JSON; this module decides which keys a record must
//! carry and how their values map onto column types. A missing required key is
//! a [`RecordError::MissingKey`]; a present key of the wrong shape is a
//! [`RecordError::InvalidValue`].
use std::collections::BTreeMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("missing key `{key}` in {context}")]
    MissingKey { context: String, key: &'static str },
    #[error("invalid value for `{key}` in {context}: {reason}")]
    InvalidValue {
        context: String,
        key: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub product_description: Option<String>,
    pub image: Option<String>,
    pub banner_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: i64,
    pub sku: String,
    pub name: Option<String>,
    pub category_id: i64,
    pub product_type: Option<String>,
    pub brand: Option<String>,
    pub brief_description: Option<String>,
    pub full_description: Option<String>,
    pub fitting_instructions: Option<String>,
    pub fitting_instructions_qr: Option<String>,
    pub coversheet: Option<String>,
    pub date_created: NaiveDateTime,
    pub date_modified: NaiveDateTime,
    pub ean: Option<String>,
    pub site_price: Option<BigDecimal>,
    pub dealer_price_gbp: Option<BigDecimal>,
    pub dealer_price_usd: Option<BigDecimal>,
    pub dealer_price_eur: Option<BigDecimal>,
}

/// Read-optimised projection of [`Product`], written alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductSummary {
    pub id: i64,
    pub sku: String,
    pub date_created: NaiveDateTime,
    pub date_modified: NaiveDateTime,
    pub site_price: Option<BigDecimal>,
}

impl From<&Product> for ProductSummary {
    fn from(p: &Product) -> Self {
        Self {
            id: p.id,
            sku: p.sku.clone(),
            date_created: p.date_created,
            date_modified: p.date_modified,
            site_price: p.site_price.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdditionalField {
    pub product_id: i64,
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Make {
    pub id: i64,
    pub name: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub id: i64,
    pub name: Option<String>,
    pub image: Option<String>,
    pub make_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Year {
    pub id: i64,
    pub name: Option<String>,
    pub image: Option<String>,
    pub mic: Option<String>,
    pub model_id: i64,
}

/// A model and the years nested under it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFitment {
    pub model: Model,
    pub years: Vec<Year>,
}

/// A make and its model/year subtree (the vendor's `bikes[]` entry).
#[derive(Debug, Clone, PartialEq)]
pub struct MakeFitment {
    pub make: Make,
    pub models: Vec<ModelFitment>,
}

/// Everything one product detail payload writes, in foreign-key order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRecord {
    pub category: Category,
    pub product: Product,
    pub summary: ProductSummary,
    pub additional_fields: Vec<AdditionalField>,
    pub fitment: Vec<MakeFitment>,
}

/// Fitment rows flattened per table, each table ascending by id with one row per id.
///
/// Makes, models and years are shared between products, so concurrent writers
/// must lock them in one global order: all makes, then all models, then all years,
/// each by ascending id. A repeated id keeps the last occurrence in payload order.
#[derive(Debug, Default, PartialEq)]
pub struct FitmentRows<'a> {
    pub makes: Vec<&'a Make>,
    pub models: Vec<&'a Model>,
    pub years: Vec<&'a Year>,
}

impl ProductRecord {
    pub fn fitment_rows(&self) -> FitmentRows<'_> {
        let mut makes = BTreeMap::new();
        let mut models = BTreeMap::new();
        let mut years = BTreeMap::new();
        for make in &self.fitment {
            makes.insert(make.make.id, &make.make);
            for model in &make.models {
                models.insert(model.model.id, &model.model);
                for year in &model.years {
                    years.insert(year.id, year);
                }
            }
        }
        FitmentRows {
            makes: makes.into_values().collect(),
            models: models.into_values().collect(),
            years: years.into_values().collect(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let root = Obj::root(value, "product")?;

        let category = parse_category(&root.obj("category")?)?;

        let product = Product {
            id: root.id("id")?,
            sku: root.required_string("sku")?,
            name: root.text("name")?,
            category_id: category.id,
            product_type: root.text("productType")?,
            brand: root.text("brand")?,
            brief_description: root.opt_text("briefDescription")?,
            full_description: root.opt_text("fullDescription")?,
            fitting_instructions: root.text("fittingInstructions")?,
            fitting_instructions_qr: root.text("fittingInstructionsQR")?,
            coversheet: root.text("coversheet")?,
            date_created: root.timestamp("dateCreated")?,
            date_modified: root.timestamp("dateModified")?,
            ean: root.text("ean")?,
            site_price: root.decimal("sitePrice")?,
            dealer_price_gbp: root.opt_decimal("dealerPriceGBP")?,
            dealer_price_usd: root.opt_decimal("dealerPriceUSD")?,
            dealer_price_eur: root.opt_decimal("dealerPriceEUR")?,
        };
        let summary = ProductSummary::from(&product);

        let mut additional_fields = Vec::new();
        for (i, field) in root.array("additionalFields")?.iter().enumerate() {
            let f = Obj::nested(field, format!("product.additionalFields[{i}]"), "additionalFields")?;
            additional_fields.push(AdditionalField {
                product_id: product.id,
                name: f.required_string("name")?,
                value: f.text("value")?,
            });
        }

        let mut fitment = Vec::new();
        for (mi, make_v) in root.array("bikes")?.iter().enumerate() {
            let make_ctx = format!("product.bikes[{mi}]");
            let m = Obj::nested(make_v, make_ctx.clone(), "bikes")?;
            let make = Make {
                id: m.id("id")?,
                name: m.text("name")?,
                image: m.text("image")?,
            };
            let mut models = Vec::new();
            for (oi, model_v) in m.array("models")?.iter().enumerate() {
                let model_ctx = format!("{make_ctx}.models[{oi}]");
                let o = Obj::nested(model_v, model_ctx.clone(), "models")?;
                let model = Model {
                    id: o.id("id")?,
                    name: o.text("name")?,
                    image: o.text("image")?,
                    make_id: make.id,
                };
                let mut years = Vec::new();
                for (yi, year_v) in o.array("years")?.iter().enumerate() {
                    let y = Obj::nested(year_v, format!("{model_ctx}.years[{yi}]"), "years")?;
                    years.push(Year {
                        id: y.id("id")?,
                        name: y.text("name")?,
                        image: y.opt_text("image")?,
                        mic: y.text("mic")?,
                        model_id: model.id,
                    });
                }
                models.push(ModelFitment { model, years });
            }
            fitment.push(MakeFitment { make, models });
        }

        Ok(Self {
            category,
            product,
            summary,
            additional_fields,
            fitment,
        })
    }
}

fn parse_category(c: &Obj<'_>) -> Result<Category, RecordError> {
    Ok(Category {
        id: c.id("id")?,
        name: c.text("name")?,
        description: c.opt_text("description")?,
        product_description: c.opt_text("productDescription")?,
        image: c.text("image")?,
        banner_image: c.opt_text("bannerImage")?,
    })
}

/// Best-effort label for log lines, usable on records that fail to parse.
pub fn record_label(value: &Value) -> String {
    match (value.get("sku").and_then(Value::as_str), value.get("id")) {
        (Some(sku), _) => sku.to_string(),
        (None, Some(id)) if !id.is_null() => format!("id={id}"),
        _ => "<unknown>".to_string(),
    }
}

/// JSON object plus a path for error messages.
struct Obj<'a> {
    context: String,
    map: &'a Map<String, Value>,
}

impl<'a> Obj<'a> {
    fn root(value: &'a Value, context: &str) -> Result<Self, RecordError> {
        Self::nested(value, context.to_string(), "<root>")
    }

    fn nested(value: &'a Value, context: String, key: &'static str) -> Result<Self, RecordError> {
        match value.as_object() {
            Some(map) => Ok(Self { context, map }),
            None => Err(RecordError::InvalidValue {
                context,
                key,
                reason: format!("expected object, got {}", kind(value)),
            }),
        }
    }

    fn invalid(&self, key: &'static str, reason: impl Into<String>) -> RecordError {
        RecordError::InvalidValue {
            context: self.context.clone(),
            key,
            reason: reason.into(),
        }
    }

    fn required(&self, key: &'static str) -> Result<&'a Value, RecordError> {
        self.map.get(key).ok_or_else(|| RecordError::MissingKey {
            context: self.context.clone(),
            key,
        })
    }

    fn obj(&self, key: &'static str) -> Result<Obj<'a>, RecordError> {
        let v = self.required(key)?;
        Obj::nested(v, format!("{}.{key}", self.context), key)
    }

    fn array(&self, key: &'static str) -> Result<&'a Vec<Value>, RecordError> {
        let v = self.required(key)?;
        v.as_array()
            .ok_or_else(|| self.invalid(key, format!("expected array, got {}", kind(v))))
    }

    fn id(&self, key: &'static str) -> Result<i64, RecordError> {
        let v = self.required(key)?;
        match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| self.invalid(key, format!("expected integer id, got {v}")))
    }

    fn required_string(&self, key: &'static str) -> Result<String, RecordError> {
        self.text(key)?
            .ok_or_else(|| self.invalid(key, "expected non-null string"))
    }

    /// Required key; JSON null becomes `None`.
    fn text(&self, key: &'static str) -> Result<Option<String>, RecordError> {
        let v = self.required(key)?;
        self.coerce_text(key, v)
    }

    fn opt_text(&self, key: &'static str) -> Result<Option<String>, RecordError> {
        match self.map.get(key) {
            Some(v) => self.coerce_text(key, v),
            None => Ok(None),
        }
    }

    fn coerce_text(&self, key: &'static str, v: &Value) -> Result<Option<String>, RecordError> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            Value::Number(n) => Ok(Some(n.to_string())),
            Value::Bool(b) => Ok(Some(b.to_string())),
            other => Err(self.invalid(key, format!("expected scalar, got {}", kind(other)))),
        }
    }

    fn timestamp(&self, key: &'static str) -> Result<NaiveDateTime, RecordError> {
        let v = self.required(key)?;
        let raw = v
            .as_str()
            .ok_or_else(|| self.invalid(key, format!("expected timestamp string, got {}", kind(v))))?;
        parse_timestamp(raw).ok_or_else(|| self.invalid(key, format!("unparseable timestamp {raw:?}")))
    }

    fn decimal(&self, key: &'static str) -> Result<Option<BigDecimal>, RecordError> {
        let v = self.required(key)?;
        self.coerce_decimal(key, v)
    }

    fn opt_decimal(&self, key: &'static str) -> Result<Option<BigDecimal>, RecordError> {
        match self.map.get(key) {
            Some(v) => self.coerce_decimal(key, v),
            None => Ok(None),
        }
    }

    fn coerce_decimal(&self, key: &'static str, v: &Value) -> Result<Option<BigDecimal>, RecordError> {
        let raw = match v {
            Value::Null => return Ok(None),
            // Number's Display is the shortest round-trip form, so 19.99 stays 19.99.
            Value::Number(n) => n.to_string(),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s.trim().to_string(),
            other => return Err(self.invalid(key, format!("expected decimal, got {}", kind(other)))),
        };
        BigDecimal::from_str(&raw)
            .map(Some)
            .map_err(|e| self.invalid(key, format!("{raw:?}: {e}")))
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// ISO-8601 with or without offset; offsets are normalised to UTC.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{json, Value};

    /// Full detail payload for SKU CP0546BL with an empty fitment list.
    pub fn product_json(id: i64, sku: &str, category_id: i64) -> Value {
        json!({
            "id": id,
            "sku": sku,
            "name": "Clutch Cover Protector",
            "category": {
                "id": category_id,
                "name": "Clutch",
                "description": "Engine case protection",
                "productDescription": null,
                "image": "https://cdn.example/cat/clutch.jpg",
                "bannerImage": "https://cdn.example/cat/clutch-banner.jpg"
            },
            "productType": "Engine Case Cover",
            "brand": "R&G",
            "briefDescription": "Protects the clutch cover",
            "fullDescription": "<p>Protects the clutch cover in a spill.</p>",
            "fittingInstructions": "https://cdn.example/fit/CP0546.pdf",
            "fittingInstructionsQR": "https://cdn.example/fit/CP0546-qr.png",
            "coversheet": "https://cdn.example/cover/CP0546.pdf",
            "dateCreated": "2021-03-04T10:15:00",
            "dateModified": "2023-11-20T08:00:00Z",
            "ean": "5055735512345",
            "sitePrice": 34.99,
            "dealerPriceGBP": 19.99,
            "dealerPriceUSD": 24.5,
            "dealerPriceEUR": "22.10",
            "additionalFields": [{"name": "color", "value": "black"}],
            "bikes": []
        })
    }

    /// One make with one model holding two years.
    pub fn fitment_json() -> Value {
        json!([{
            "id": 3,
            "name": "Kawasaki",
            "image": "kawasaki.png",
            "models": [{
                "id": 30,
                "name": "Z900",
                "image": "z900.png",
                "years": [
                    {"id": 300, "name": "2020", "mic": "KZ900-20"},
                    {"id": 301, "name": "2021", "mic": "KZ900-21", "image": "z900-21.png"}
                ]
            }]
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{fitment_json, product_json};
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_record() {
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = fitment_json();
        let rec = ProductRecord::from_value(&v).unwrap();

        assert_eq!(rec.category.id, 7);
        assert_eq!(rec.category.name.as_deref(), Some("Clutch"));
        assert_eq!(rec.category.product_description, None);
        assert_eq!(rec.product.category_id, 7);
        assert_eq!(rec.product.dealer_price_gbp, Some(BigDecimal::from_str("19.99").unwrap()));
        assert_eq!(rec.product.dealer_price_eur, Some(BigDecimal::from_str("22.10").unwrap()));
        assert_eq!(rec.summary.sku, "CP0546BL");
        assert_eq!(rec.summary.site_price, rec.product.site_price);
        assert_eq!(rec.additional_fields.len(), 1);

        let make = &rec.fitment[0];
        assert_eq!(make.make.id, 3);
        assert_eq!(make.models[0].model.make_id, 3);
        let years = &make.models[0].years;
        assert_eq!(years[0].model_id, 30);
        assert_eq!(years[0].image, None);
        assert_eq!(years[1].image.as_deref(), Some("z900-21.png"));
    }

    #[test]
    fn optional_keys_may_be_absent() {
        let mut v = product_json(42, "CP0546BL", 7);
        let obj = v.as_object_mut().unwrap();
        for key in ["briefDescription", "fullDescription", "dealerPriceGBP", "dealerPriceUSD", "dealerPriceEUR"] {
            obj.remove(key);
        }
        v["category"].as_object_mut().unwrap().remove("bannerImage");

        let rec = ProductRecord::from_value(&v).unwrap();
        assert_eq!(rec.product.dealer_price_gbp, None);
        assert_eq!(rec.category.banner_image, None);
    }

    #[test]
    fn missing_required_key_is_a_lookup_failure() {
        let mut v = product_json(42, "CP0546BL", 7);
        v.as_object_mut().unwrap().remove("ean");
        let err = ProductRecord::from_value(&v).unwrap_err();
        assert!(matches!(err, RecordError::MissingKey { key: "ean", .. }), "{err}");
    }

    #[test]
    fn missing_mic_names_the_nested_path() {
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = fitment_json();
        v["bikes"][0]["models"][0]["years"][1]
            .as_object_mut()
            .unwrap()
            .remove("mic");

        let err = ProductRecord::from_value(&v).unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing key `mic` in product.bikes[0].models[0].years[1]"
        );
    }

    #[test]
    fn rejects_non_integer_ids_and_bad_dates() {
        let mut v = product_json(42, "CP0546BL", 7);
        v["category"]["id"] = json!("seven");
        assert!(matches!(
            ProductRecord::from_value(&v).unwrap_err(),
            RecordError::InvalidValue { key: "id", .. }
        ));

        let mut v = product_json(42, "CP0546BL", 7);
        v["dateCreated"] = json!("last tuesday");
        assert!(matches!(
            ProductRecord::from_value(&v).unwrap_err(),
            RecordError::InvalidValue { key: "dateCreated", .. }
        ));
    }

    #[test]
    fn timestamps_accept_common_iso_shapes() {
        let expected = NaiveDateTime::parse_from_str("2023-11-20 08:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(parse_timestamp("2023-11-20T08:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2023-11-20T08:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2023-11-20T09:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2023-11-20 08:00:00.000"), Some(expected));
        assert!(parse_timestamp("2023-11-20").is_some());
        assert_eq!(parse_timestamp("nope"), None);
    }

    #[test]
    fn fitment_rows_are_sorted_and_deduplicated_per_table() {
        let mut v = product_json(42, "CP0546BL", 7);
        v["bikes"] = json!([
            {"id": 2, "name": "Yamaha", "image": null, "models": [
                {"id": 21, "name": "MT-09", "image": null, "years": [
                    {"id": 212, "name": "2022", "mic": "Y9-22"},
                    {"id": 211, "name": "2021", "mic": "Y9-21"}
                ]},
                {"id": 20, "name": "MT-07", "image": null, "years": []}
            ]},
            {"id": 1, "name": "Honda", "image": null, "models": [
                {"id": 10, "name": "CB650R", "image": null, "years": [
                    {"id": 100, "name": "2019", "mic": "H6-19"}
                ]}
            ]},
            {"id": 2, "name": "Yamaha Motor", "image": null, "models": []}
        ]);
        let rec = ProductRecord::from_value(&v).unwrap();
        let rows = rec.fitment_rows();

        let make_ids: Vec<i64> = rows.makes.iter().map(|m| m.id).collect();
        let model_ids: Vec<i64> = rows.models.iter().map(|m| m.id).collect();
        let year_ids: Vec<i64> = rows.years.iter().map(|y| y.id).collect();
        assert_eq!(make_ids, vec![1, 2]);
        assert_eq!(model_ids, vec![10, 20, 21]);
        assert_eq!(year_ids, vec![100, 211, 212]);
        assert_eq!(rows.makes[1].name.as_deref(), Some("Yamaha Motor"));
    }

    #[test]
    fn labels_fall_back_to_id() {
        assert_eq!(record_label(&json!({"sku": "X1", "id": 1})), "X1");
        assert_eq!(record_label(&json!({"id": 9})), "id=9");
        assert_eq!(record_label(&json!([])), "<unknown>");
    }
}
