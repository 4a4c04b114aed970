use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::SriConfig;
use crate::error::{BillingError, BillingResult};
use crate::fiscal::access_key::{self, AccessKeyParts, DOC_TYPE_INVOICE, EMISSION_TYPE_NORMAL};
use crate::models::{round_money, Client, Invoice, InvoiceItem};

/// Layout version of the invoice document.
pub const FACTURA_VERSION: &str = "1.1.0";

/// VAT tax code.
const TAX_CODE_IVA: &str = "2";

/// "Other, using the financial system" payment form.
const PAYMENT_FORM_FINANCIAL_SYSTEM: &str = "20";

/// Everything the document is built from.
#[derive(Debug, Clone)]
pub struct FiscalSource {
    pub invoice: Invoice,
    pub items: Vec<InvoiceItem>,
    pub client: Client,
}

/// An unsigned fiscal document and its access key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiscalDocument {
    pub access_key: String,
    pub xml: String,
}

/// Escapes text for use in element content and attribute values.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
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

/// Percentage code for a VAT rate.
pub fn iva_rate_code(rate: Decimal) -> BillingResult<&'static str> {
    let code = match rate.normalize().to_string().as_str() {
        "0" => "0",
        "12" => "2",
        "14" => "3",
        "15" => "4",
        "5" => "5",
        "13" => "10",
        other => {
            return Err(BillingError::validation(format!(
                "tax rate {}% has no fiscal rate code",
                other
            )))
        }
    };
    Ok(code)
}

/// Splits `PREFIX-YYYY-NNNNNN` into year and sequence.
pub fn number_parts(invoice_number: &str) -> BillingResult<(i32, u32)> {
    let mut parts = invoice_number.rsplitn(3, '-');
    let sequence = parts.next().and_then(|s| s.parse::<u32>().ok());
    let year = parts.next().and_then(|s| s.parse::<i32>().ok());
    match (year, sequence, parts.next()) {
        (Some(year), Some(sequence), Some(_)) => Ok((year, sequence)),
        _ => Err(BillingError::validation(format!(
            "invoice number '{}' is malformed",
            invoice_number
        ))),
    }
}

fn money(value: Decimal) -> String {
    format!("{:.2}", value)
}

struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            depth: 0,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn open(&mut self, tag: &str) {
        self.open_with(tag, &[]);
    }

    fn open_with(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        for (name, value) in attrs {
            self.out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
        }
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.out.push_str(&format!("</{}>\n", tag));
    }

    fn leaf(&mut self, tag: &str, value: &str) {
        self.indent();
        self.out
            .push_str(&format!("<{}>{}</{}>\n", tag, escape(value), tag));
    }

    fn leaf_with(&mut self, tag: &str, attrs: &[(&str, &str)], value: &str) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        for (name, v) in attrs {
            self.out.push_str(&format!(" {}=\"{}\"", name, escape(v)));
        }
        self.out
            .push_str(&format!(">{}</{}>\n", escape(value), tag));
    }

    fn finish(self) -> String {
        self.out
    }
}

fn check_issuer(issuer: &SriConfig) -> BillingResult<()> {
    if issuer.legal_name.trim().is_empty() {
        return Err(BillingError::Configuration(
            "issuer legal name is not configured".to_string(),
        ));
    }
    if issuer.address.trim().is_empty() {
        return Err(BillingError::Configuration(
            "issuer address is not configured".to_string(),
        ));
    }
    Ok(())
}

/// Builds the `factura` document for an invoice.
pub fn build(issuer: &SriConfig, source: &FiscalSource) -> BillingResult<FiscalDocument> {
    check_issuer(issuer)?;

    let invoice = &source.invoice;
    let client = &source.client;
    client
        .identification_type
        .validate(&client.identification)?;

    let rate_code = iva_rate_code(invoice.tax_rate)?;
    let (year, sequence) = number_parts(&invoice.invoice_number)?;
    let sequential = access_key::sequential(year, sequence);
    let numeric_code = access_key::numeric_code_for(invoice.id);

    let key = access_key::generate(&AccessKeyParts {
        issue_date: invoice.issue_date,
        ruc: &issuer.ruc,
        environment: issuer.environment,
        establishment: &issuer.establishment,
        emission_point: &issuer.emission_point,
        sequential: &sequential,
        numeric_code: &numeric_code,
    })?;

    let total_discount: Decimal = source.items.iter().map(|i| i.discount).sum();

    let mut w = XmlWriter::new();
    w.open_with(
        "factura",
        &[("id", "comprobante"), ("version", FACTURA_VERSION)],
    );

    w.open("infoTributaria");
    w.leaf("ambiente", &issuer.environment.to_string());
    w.leaf("tipoEmision", EMISSION_TYPE_NORMAL);
    w.leaf("razonSocial", &issuer.legal_name);
    w.leaf("ruc", &issuer.ruc);
    w.leaf("claveAcceso", &key);
    w.leaf("codDoc", DOC_TYPE_INVOICE);
    w.leaf("estab", &issuer.establishment);
    w.leaf("ptoEmi", &issuer.emission_point);
    w.leaf("secuencial", &sequential);
    w.leaf("dirMatriz", &issuer.address);
    w.close("infoTributaria");

    w.open("infoFactura");
    w.leaf("fechaEmision", &invoice.issue_date.format("%d/%m/%Y").to_string());
    w.leaf("dirEstablecimiento", &issuer.address);
    w.leaf(
        "tipoIdentificacionComprador",
        client.identification_type.sri_code(),
    );
    w.leaf("razonSocialComprador", &client.name);
    w.leaf("identificacionComprador", &client.identification);
    if let Some(address) = &client.address {
        w.leaf("direccionComprador", address);
    }
    w.leaf("totalSinImpuestos", &money(invoice.subtotal));
    w.leaf("totalDescuento", &money(total_discount));
    w.open("totalConImpuestos");
    w.open("totalImpuesto");
    w.leaf("codigo", TAX_CODE_IVA);
    w.leaf("codigoPorcentaje", rate_code);
    w.leaf("baseImponible", &money(invoice.subtotal));
    w.leaf("valor", &money(invoice.tax_amount));
    w.close("totalImpuesto");
    w.close("totalConImpuestos");
    w.leaf("propina", "0.00");
    w.leaf("importeTotal", &money(invoice.total));
    w.leaf("moneda", "DOLAR");
    w.open("pagos");
    w.open("pago");
    w.leaf("formaPago", PAYMENT_FORM_FINANCIAL_SYSTEM);
    w.leaf("total", &money(invoice.total));
    w.close("pago");
    w.close("pagos");
    w.close("infoFactura");

    let mut items: Vec<&InvoiceItem> = source.items.iter().collect();
    items.sort_by_key(|item| item.position);

    w.open("detalles");
    for item in items {
        let item_tax = round_money(item.subtotal * invoice.tax_rate / Decimal::ONE_HUNDRED);
        w.open("detalle");
        w.leaf("codigoPrincipal", &(item.position + 1).to_string());
        w.leaf("descripcion", &item.description);
        w.leaf("cantidad", &money(item.quantity));
        w.leaf("precioUnitario", &money(item.unit_price));
        w.leaf("descuento", &money(item.discount));
        w.leaf("precioTotalSinImpuesto", &money(item.subtotal));
        w.open("impuestos");
        w.open("impuesto");
        w.leaf("codigo", TAX_CODE_IVA);
        w.leaf("codigoPorcentaje", rate_code);
        w.leaf("tarifa", &invoice.tax_rate.normalize().to_string());
        w.leaf("baseImponible", &money(item.subtotal));
        w.leaf("valor", &money(item_tax));
        w.close("impuesto");
        w.close("impuestos");
        w.close("detalle");
    }
    w.close("detalles");

    if let Some(email) = &client.email {
        w.open("infoAdicional");
        w.leaf_with("campoAdicional", &[("nombre", "Email")], email);
        w.close("infoAdicional");
    }

    w.close("factura");

    Ok(FiscalDocument {
        access_key: key,
        xml: w.finish(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::invoice::tests::sample_invoice;
    use crate::models::{IdentificationType, NewLineItem};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    pub(crate) fn issuer() -> SriConfig {
        SriConfig {
            environment: 1,
            ruc: "1792146739001".to_string(),
            legal_name: "Estudio Web & Asociados".to_string(),
            establishment: "001".to_string(),
            emission_point: "001".to_string(),
            address: "Av. Amazonas N34-120, Quito".to_string(),
            authority_url: "http://localhost:8089".to_string(),
            timeout: Duration::from_secs(5),
            cert_path: None,
            cert_valid_until: None,
            poll_delay: Duration::from_secs(60),
            max_polls: 10,
        }
    }

    pub(crate) fn source() -> FiscalSource {
        let mut agg = sample_invoice(dec!(3450.00));
        agg.update(
            crate::models::UpdateInvoice {
                items: vec![
                    NewLineItem::new("Diseño <web>", dec!(1), dec!(2500)),
                    NewLineItem::new("SEO", dec!(1), dec!(500)),
                ],
                tax_rate: dec!(15),
                due_date: None,
                notes: None,
            },
            Utc::now(),
        )
        .unwrap();
        agg.invoice.invoice_number = "FAC-2026-000042".to_string();

        let now = Utc::now();
        FiscalSource {
            client: Client {
                id: agg.invoice.client_id,
                name: "Ana Pérez".to_string(),
                identification_type: IdentificationType::Cedula,
                identification: "1712345678".to_string(),
                email: Some("ana@cliente.ec".to_string()),
                phone: None,
                address: None,
                created_at: now,
                updated_at: now,
            },
            invoice: agg.invoice,
            items: agg.items,
        }
    }

    #[test]
    fn test_document_carries_key_and_totals() {
        let source = source();
        let doc = build(&issuer(), &source).unwrap();

        assert!(access_key::is_valid(&doc.access_key));
        assert!(doc.xml.contains(&format!("<claveAcceso>{}</claveAcceso>", doc.access_key)));
        assert!(doc.xml.contains("<factura id=\"comprobante\" version=\"1.1.0\">"));
        assert!(doc.xml.contains("<secuencial>260000042</secuencial>"));
        assert!(doc.xml.contains("<totalSinImpuestos>3000.00</totalSinImpuestos>"));
        assert!(doc.xml.contains("<valor>450.00</valor>"));
        assert!(doc.xml.contains("<importeTotal>3450.00</importeTotal>"));
        assert!(doc.xml.contains("<codigoPorcentaje>4</codigoPorcentaje>"));
        assert!(doc.xml.contains("<tipoIdentificacionComprador>05</tipoIdentificacionComprador>"));
    }

    #[test]
    fn test_text_is_escaped() {
        let doc = build(&issuer(), &source()).unwrap();
        assert!(doc.xml.contains("Estudio Web &amp; Asociados"));
        assert!(doc.xml.contains("Diseño &lt;web&gt;"));
    }

    #[test]
    fn test_rebuild_yields_same_key() {
        let source = source();
        let first = build(&issuer(), &source).unwrap();
        let second = build(&issuer(), &source).unwrap();
        assert_eq!(first.access_key, second.access_key);
    }

    #[test]
    fn test_missing_issuer_name_is_configuration_error() {
        let mut issuer = issuer();
        issuer.legal_name = String::new();
        assert!(matches!(
            build(&issuer, &source()),
            Err(BillingError::Configuration(_))
        ));
    }

    #[test]
    fn test_number_parts() {
        assert_eq!(number_parts("FAC-2026-000042").unwrap(), (2026, 42));
        assert!(number_parts("garbage").is_err());
        assert_eq!(iva_rate_code(dec!(15.00)).unwrap(), "4");
        assert!(iva_rate_code(dec!(7)).is_err());
    }
}
