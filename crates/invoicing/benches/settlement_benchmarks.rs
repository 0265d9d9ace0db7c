use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use leasebook_core::{InvoiceId, Money};
use leasebook_invoicing::{
    recompute, CreditInvoice, Invoice, InvoiceRow, InvoiceType, Payment,
};

fn fixture(row_count: usize) -> (Invoice, Vec<InvoiceRow>, Vec<Payment>, Vec<CreditInvoice>) {
    let invoice = Invoice::open(InvoiceId::new(), InvoiceType::Charge, None);
    let rows = (0..row_count)
        .map(|i| InvoiceRow::new(Money::from_cents(10_000 + i as i64)))
        .collect();
    let paid_date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
    let payments = (0..row_count / 2)
        .map(|_| Payment::new(Money::from_cents(5_000), paid_date))
        .collect();
    let credits = vec![CreditInvoice {
        id: InvoiceId::new(),
        rows: (0..row_count / 4)
            .map(|_| InvoiceRow::new(Money::from_cents(2_500)))
            .collect(),
    }];
    (invoice, rows, payments, credits)
}

fn bench_recompute(c: &mut Criterion) {
    let mut group = c.benchmark_group("settlement_recompute");
    for row_count in [1usize, 10, 100, 1_000] {
        let (invoice, rows, payments, credits) = fixture(row_count);
        group.throughput(Throughput::Elements(row_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(row_count), &row_count, |b, _| {
            b.iter(|| {
                recompute(
                    black_box(&invoice),
                    black_box(&rows),
                    black_box(&payments),
                    black_box(&credits),
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_recompute);
criterion_main!(benches);
