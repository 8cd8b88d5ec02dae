//! Cascade deletes and reactive fields settling before the flush.

mod support;

use sqlgraph::{Cx, DeletedState, EntityManager, EntityRef, Error, FlushOptions, Value};
use support::*;

fn position(log: &[String], statement: &str) -> usize {
    log.iter()
        .position(|s| s == statement)
        .unwrap_or_else(|| panic!("{statement} not in {log:?}"))
}

fn count_books(author: &EntityRef) -> sqlgraph::Result<usize> {
    Ok(author.one_to_many(author.field_id("books")?).get()?.len())
}

fn new_book(em: &EntityManager, title: &str, author: &EntityRef) -> EntityRef {
    let book = em.create_with("Book", [("title", Value::from(title))]).unwrap();
    book.many_to_one(book.field_id("author").unwrap())
        .set(Some(author))
        .unwrap();
    book
}

#[test]
fn delete_is_idempotent() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let b3 = unwrap_outcome(em.load(&cx, "Book", "b:3").await);
        em.delete(&b3).unwrap();
        em.delete(&b3).unwrap();
        assert_eq!(b3.deleted_state(), DeletedState::Pending);
        assert!(matches!(
            b3.set_by_name("title", "gone"),
            Err(Error::ReadOnly { .. })
        ));

        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(b3.deleted_state(), DeletedState::Deleted);
        assert_eq!(em.find_existing("b:3"), None);
    });

    assert_eq!(driver.count("DELETE books"), 1);
    assert!(driver.row("books", 3).is_none());
}

#[test]
fn cascade_reaches_relations_that_were_never_loaded() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let p1 = unwrap_outcome(em.load(&cx, "Publisher", "p:1").await);
        em.delete(&p1).unwrap();
        // Nothing below the publisher is known yet.
        assert_eq!(em.entities().len(), 1);

        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(p1.deleted_state(), DeletedState::Deleted);
    });

    assert!(driver.rows("publishers").is_empty());
    let authors: Vec<_> = driver.rows("authors").iter().map(|r| r.get_by_name("id").cloned()).collect();
    assert_eq!(authors, vec![Some(Value::BigInt(2))]);
    let books: Vec<_> = driver.rows("books").iter().map(|r| r.get_by_name("id").cloned()).collect();
    assert_eq!(books, vec![Some(Value::BigInt(3))]);
    assert!(driver.rows("book_reviews").is_empty());
    assert!(driver.rows("books_to_tags").is_empty());
    // The far side of a many-to-many survives.
    assert_eq!(driver.rows("tags").len(), 1);

    let log = driver.log();
    assert!(position(&log, "DELETE book_reviews") < position(&log, "DELETE books"));
    assert!(position(&log, "DELETE books") < position(&log, "COMMIT"));
}

#[test]
fn loaded_cascades_apply_immediately() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        unwrap_outcome(em.populate(&cx, std::slice::from_ref(&a1), "books.reviews").await);
        let books = a1.one_to_many(a1.field_id("books").unwrap()).get().unwrap();

        em.delete(&a1).unwrap();
        for book in &books {
            assert!(book.is_deleted());
        }
        let reviews = books[0]
            .one_to_many(books[0].field_id("reviews").unwrap())
            .get_with_deleted()
            .unwrap();
        assert!(reviews.iter().all(EntityRef::is_deleted));
        assert_eq!(count_books(&a1).unwrap(), 0);
    });
}

#[test]
fn new_child_recalculates_the_parent_count() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let a2 = unwrap_outcome(em.load(&cx, "Author", "a:2").await);
        driver.clear_log();
        new_book(&em, "b4", &a2);
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(a2.get_by_name("number_of_books").unwrap(), Value::BigInt(2));
    });

    // The recalculation loads the collection once, before the transaction.
    let log = driver.log();
    assert_eq!(log.len(), 5, "{log:?}");
    assert_eq!(log[0], "SELECT books");
    assert_eq!(log[1], "BEGIN");
    assert!(position(&log, "INSERT books") < position(&log, "COMMIT"));
    assert!(position(&log, "UPDATE authors") < position(&log, "COMMIT"));
    assert_eq!(
        driver.row("authors", 2).unwrap().get_by_name("number_of_books"),
        Some(&Value::BigInt(2))
    );
}

#[test]
fn reactive_fields_read_current_values_before_a_flush() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        assert_eq!(a1.get_by_name("number_of_books").unwrap(), Value::BigInt(2));

        // Not loaded yet: the stored value is all there is.
        new_book(&em, "b4", &a1);
        assert_eq!(a1.get_by_name("number_of_books").unwrap(), Value::BigInt(2));

        unwrap_outcome(em.populate(&cx, std::slice::from_ref(&a1), "books").await);
        assert_eq!(a1.get_by_name("number_of_books").unwrap(), Value::BigInt(3));

        let err = a1.set_by_name("number_of_books", 7).unwrap_err();
        assert!(matches!(err, Error::ReadOnly { .. }));
    });
}

#[test]
fn deleted_child_recalculates_the_parent_and_cascades() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let b1 = unwrap_outcome(em.load(&cx, "Book", "b:1").await);
        em.delete(&b1).unwrap();
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
    });

    assert_eq!(
        driver.row("authors", 1).unwrap().get_by_name("number_of_books"),
        Some(&Value::BigInt(1))
    );
    assert!(driver.rows("book_reviews").is_empty());
    assert!(driver.rows("books_to_tags").is_empty());
    let log = driver.log();
    assert!(position(&log, "BEGIN") < position(&log, "UPDATE authors"));
    assert!(position(&log, "DELETE book_reviews") < position(&log, "DELETE books"));
}

#[test]
fn moving_a_child_recalculates_both_parents() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let em = manager(&driver);
    let cx = Cx::for_testing();

    run(async {
        let b3 = unwrap_outcome(em.load(&cx, "Book", "b:3").await);
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        b3.many_to_one(b3.field_id("author").unwrap())
            .set(Some(&a1))
            .unwrap();
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
    });

    let count = |id| {
        driver
            .row("authors", id)
            .and_then(|r| r.get_by_name("number_of_books").cloned())
    };
    assert_eq!(count(1), Some(Value::BigInt(3)));
    assert_eq!(count(2), Some(Value::BigInt(0)));
}

#[test]
fn derived_fields_are_synced_before_writing() {
    let driver = MemoryDriver::new();
    let registry = registry_with(|name, entity| {
        if name != "Book" {
            return entity;
        }
        entity
            .field(sqlgraph::Field::primitive("search_title"))
            .derived_field("search_title", |book| {
                let title = book.get_by_name("title")?;
                Ok(title
                    .as_str()
                    .map_or(Value::Null, |t| Value::from(t.to_lowercase())))
            })
    });
    let em = EntityManager::new(registry, driver.clone());
    let cx = Cx::for_testing();

    run(async {
        let author = em.create_with("Author", [("first_name", Value::from("a1"))]).unwrap();
        let book = new_book(&em, "The Title", &author);
        assert!(matches!(
            book.set_by_name("search_title", "x"),
            Err(Error::ReadOnly { .. })
        ));
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);

        book.set_by_name("title", "Second").unwrap();
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
    });

    assert_eq!(
        driver.row("books", 1).unwrap().get_by_name("search_title"),
        Some(&Value::from("second"))
    );
}

#[test]
fn reactive_rules_rerun_after_a_failed_flush() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let registry = registry_with(|name, entity| {
        if name != "Author" {
            return entity;
        }
        entity.reactive_rule("at most two books", "books", |author| {
            match count_books(author) {
                Ok(n) if n > 2 => Err(format!("has {n} books, at most 2 allowed")),
                Ok(_) => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
    });
    let em = EntityManager::new(registry, driver.clone());
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        let a2 = unwrap_outcome(em.load(&cx, "Author", "a:2").await);
        let book = new_book(&em, "b4", &a1);

        let err = expect_err(em.flush(&cx, FlushOptions::default()).await);
        let errors = err.validation().unwrap();
        assert_eq!(errors.messages(), vec!["has 3 books, at most 2 allowed"]);
        assert_eq!(errors.errors[0].entity, "Author#a:1");
        assert_eq!(errors.errors[0].kind, sqlgraph::ValidationErrorKind::Reactive);

        book.many_to_one(book.field_id("author").unwrap())
            .set(Some(&a2))
            .unwrap();
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(a2.get_by_name("number_of_books").unwrap(), Value::BigInt(2));
    });
}

#[test]
fn computed_properties_load_their_hint() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let registry = registry_with(|name, entity| {
        if name != "Author" {
            return entity;
        }
        entity.computed("review_count", "books.reviews", |author| {
            let mut total = 0_i64;
            for book in author.one_to_many(author.field_id("books")?).get()? {
                let reviews = book.one_to_many(book.field_id("reviews")?).get()?;
                total += i64::try_from(reviews.len()).unwrap_or(i64::MAX);
            }
            Ok(Value::BigInt(total))
        })
    });
    let em = EntityManager::new(registry, driver.clone());
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        assert!(matches!(
            a1.computed_now("review_count"),
            Err(Error::NotLoaded { relation: "books", .. })
        ));
        assert_eq!(
            unwrap_outcome(a1.computed(&cx, "review_count").await),
            Value::BigInt(1)
        );
        assert_eq!(a1.computed_now("review_count").unwrap(), Value::BigInt(1));
        assert!(a1.computed_now("missing").is_err());
    });
}

#[test]
fn hook_deleting_a_reactive_owner_wins_over_its_recalculation() {
    let driver = MemoryDriver::new();
    seed_library(&driver);
    let registry = registry_with(|name, entity| {
        if name != "Book" {
            return entity;
        }
        entity.hook(sqlgraph::HookPoint::BeforeFlush, |book, ctx| {
            if book.get_by_name("title")? != Value::from("purge") {
                return Ok(());
            }
            let author = book.many_to_one(book.field_id("author")?).get()?;
            match author {
                Some(author) => ctx.delete(&author),
                None => Ok(()),
            }
        })
    });
    let em = EntityManager::new(registry, driver.clone());
    let cx = Cx::for_testing();

    run(async {
        let a1 = unwrap_outcome(em.load(&cx, "Author", "a:1").await);
        let book = new_book(&em, "purge", &a1);
        unwrap_outcome(em.flush(&cx, FlushOptions::default()).await);
        assert_eq!(a1.deleted_state(), DeletedState::Deleted);
        // Created and cascaded in the same flush: never written.
        assert!(book.is_deleted());
        assert!(book.is_new());
    });

    let ids = |table| -> Vec<Option<Value>> {
        driver
            .rows(table)
            .iter()
            .map(|r| r.get_by_name("id").cloned())
            .collect()
    };
    assert_eq!(ids("authors"), vec![Some(Value::BigInt(2))]);
    assert_eq!(ids("books"), vec![Some(Value::BigInt(3))]);
    assert!(driver.rows("book_reviews").is_empty());
    assert!(driver.rows("books_to_tags").is_empty());
    assert_eq!(driver.count("INSERT books"), 0);
    assert_eq!(driver.count("UPDATE authors"), 0);
}
