use crate::numeric::E8S;
use crate::state::read_state;
use rust_decimal::prelude::ToPrimitive;
use crate::tick::SENTINEL_TICK;
use candid::CandidType;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::io::Write;

#[derive(CandidType, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
}

#[derive(CandidType, Deserialize)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteBuf,
}

impl HttpResponse {
    pub fn ok(content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status_code: 200,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: ByteBuf::from(body),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status_code: 404,
            headers: vec![],
            body: ByteBuf::from("not found"),
        }
    }
}

pub fn encode_metrics(
    metrics: &mut ic_metrics_encoder::MetricsEncoder<Vec<u8>>,
) -> std::io::Result<()> {
    read_state(|s| {
        metrics.encode_gauge(
            "keel_pool_count",
            s.pools.len() as f64,
            "Number of registered funding pools.",
        )?;
        metrics.encode_gauge(
            "keel_total_debt_kusd",
            s.total_debt().to_u64() as f64 / E8S as f64,
            "Total outstanding kUSD debt across all pools.",
        )?;
        metrics.encode_gauge(
            "keel_pending_payouts",
            s.pending_payouts.len() as f64,
            "Number of payouts waiting for a ledger retry.",
        )?;
        metrics.encode_counter(
            "keel_event_count",
            crate::storage::count_events() as f64,
            "Number of events in the stable log.",
        )?;
        let mut pool_collateral =
            metrics.gauge_vec("keel_pool_collateral", "Raw pool collateral in e8s.")?;
        for record in s.pools.values() {
            let pool_label = record.pool_id.to_string();
            pool_collateral = pool_collateral.value(
                &[("pool", pool_label.as_str())],
                record.engine.total_collateral_raw().to_f64().unwrap_or(0.0),
            )?;
        }
        Ok(())
    })
}

pub fn build_dashboard() -> Vec<u8> {
    format!(
        "
    <!DOCTYPE html>
    <html lang=\"en\">
        <head>
            <title>Keel Protocol Dashboard</title>
            <style>
                table {{
                    border: solid;
                    text-align: left;
                    width: 100%;
                    border-width: thin;
                }}
                h3 {{
                    font-variant: small-caps;
                    margin-top: 30px;
                    margin-bottom: 5px;
                }}
                .background {{ margin: 0; padding: 0; }}
                .content {{ max-width: 100vw; width: fit-content; margin: 0 auto; }}
                tbody tr:nth-child(odd) {{ background-color: #eeeeee; }}
            </style>
        </head>
        <body>
            <div class=\"background content\">
                <div>
                    <h3>Metadata</h3>
                    {}
                </div>
                <div>
                    <h3>Pools</h3>
                    {}
                </div>
            </div>
        </body>
    </html>",
        construct_metadata_table(),
        construct_pool_table(),
    )
    .into_bytes()
}

fn construct_metadata_table() -> String {
    read_state(|s| {
        format!(
            "<table>
                <tbody>
                    <tr><th>kUSD ledger</th><td>{}</td></tr>
                    <tr><th>XRC principal</th><td>{}</td></tr>
                    <tr><th>Recorded events</th><td>{}</td></tr>
                    <tr><th>Pending payouts</th><td>{}</td></tr>
                </tbody>
            </table>",
            s.kusd_ledger_principal,
            s.xrc_principal,
            crate::storage::count_events(),
            s.pending_payouts.len(),
        )
    })
}

fn construct_pool_table() -> String {
    let mut buf = Vec::new();
    let _ = write!(
        buf,
        "<table>
            <thead>
                <tr>
                    <th>Pool</th><th>Symbol</th><th>Status</th><th>Positions</th>
                    <th>Collateral (e8s)</th><th>Debt (e8s)</th><th>Top tick</th>
                    <th>Reserve (e8s)</th><th>Last price</th>
                </tr>
            </thead>
            <tbody>"
    );
    read_state(|s| {
        for record in s.pools.values() {
            let top_tick = record.engine.top_tick();
            let _ = write!(
                buf,
                "<tr><td>{}</td><td>{}</td><td>{:?}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                record.pool_id,
                record.collateral_symbol,
                record.engine.status,
                record.engine.position_count(),
                record.engine.total_collateral_raw().round(),
                record.engine.total_debt_raw().round(),
                if top_tick == SENTINEL_TICK {
                    "-".to_string()
                } else {
                    top_tick.to_string()
                },
                record.reserve.balance().round(),
                record
                    .last_price
                    .map(|p| p.anchor.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        }
    });
    let _ = write!(buf, "</tbody></table>");
    String::from_utf8_lossy(&buf).to_string()
}
