use std::time::{SystemTime, UNIX_EPOCH};

use super::value::{Object, Value};

/// Seconds since the epoch, fractional.
pub fn clock(_arg_count: usize, _args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Value::Number(now.as_millis() as f64 / 1000.0))
}

/// Integer remainder of two numbers.
pub fn modulo(arg_count: usize, args: &[Value]) -> Result<Value, String> {
    if arg_count != 2 {
        return Err(format!("Required 2 arguments but got {}", arg_count));
    }

    let a = match &args[0] {
        Value::Number(a) => *a,
        _ => return Err("Required 1st argument to be of type number.".to_owned()),
    };
    let b = match &args[1] {
        Value::Number(b) => *b,
        _ => return Err("Required 2nd argument to be of type number.".to_owned()),
    };
    if b as i64 == 0 {
        return Err("Cannot take modulo by zero.".to_owned());
    }

    Ok(Value::Number((a as i64 % b as i64) as f64))
}

/// A nil-filled list of the given length.
pub fn list(arg_count: usize, args: &[Value]) -> Result<Value, String> {
    if arg_count != 1 {
        return Err(format!("Required 1 argument but got {}", arg_count));
    }

    let len = match &args[0] {
        Value::Number(len) if *len >= 0.0 => *len as usize,
        _ => return Err("Required 1st argument to be of type number.".to_owned()),
    };

    Ok(Value::list(vec![Value::Nil; len]))
}

/// Appends a value to a list and returns the list.
pub fn append(arg_count: usize, args: &[Value]) -> Result<Value, String> {
    if arg_count != 2 {
        return Err(format!("Required 2 arguments but got {}", arg_count));
    }

    match &args[0] {
        Value::Object(Object::List(items)) => {
            items.borrow_mut().push(args[1].clone());
            Ok(args[0].clone())
        }
        _ => Err("Required 1st argument to be of type list.".to_owned()),
    }
}

/// Removes and returns the last element of a list.
pub fn pop(arg_count: usize, args: &[Value]) -> Result<Value, String> {
    if arg_count != 1 {
        return Err(format!("Required 1 argument but got {}", arg_count));
    }

    match &args[0] {
        Value::Object(Object::List(items)) => items
            .borrow_mut()
            .pop()
            .ok_or_else(|| "Cannot pop from an empty list.".to_owned()),
        _ => Err("Required 1st argument to be of type list.".to_owned()),
    }
}

/// The length of a list.
pub fn len(arg_count: usize, args: &[Value]) -> Result<Value, String> {
    if arg_count != 1 {
        return Err(format!("Required 1 argument but got {}", arg_count));
    }

    match &args[0] {
        Value::Object(Object::List(items)) => Ok(Value::Number(items.borrow().len() as f64)),
        _ => Err("Required 1st argument to be of type list.".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_clock_is_a_number() {
        match clock(0, &[]).unwrap() {
            Value::Number(seconds) => assert!(seconds > 0.0),
            other => panic!("expected a number, got {}", other),
        }
    }

    #[test]
    fn native_modulo() {
        let result = modulo(2, &[Value::Number(10.0), Value::Number(3.0)]).unwrap();
        assert!(result.equals(&Value::Number(1.0)));
        assert!(modulo(2, &[Value::Number(1.0), Value::Number(0.0)]).is_err());
        assert!(modulo(1, &[Value::Number(1.0)]).is_err());
        assert!(modulo(2, &[Value::Nil, Value::Number(1.0)]).is_err());
    }

    #[test]
    fn native_list_append_pop_len() {
        let xs = list(1, &[Value::Number(2.0)]).unwrap();
        assert!(len(1, &[xs.clone()]).unwrap().equals(&Value::Number(2.0)));

        append(2, &[xs.clone(), Value::Number(9.0)]).unwrap();
        assert!(len(1, &[xs.clone()]).unwrap().equals(&Value::Number(3.0)));

        let last = pop(1, &[xs.clone()]).unwrap();
        assert!(last.equals(&Value::Number(9.0)));
        assert!(len(1, &[xs]).unwrap().equals(&Value::Number(2.0)));
    }

    #[test]
    fn native_pop_empty_list_errors() {
        let xs = Value::list(Vec::new());
        assert!(pop(1, &[xs]).is_err());
    }

    #[test]
    fn native_type_checks() {
        assert!(append(2, &[Value::Nil, Value::Nil]).is_err());
        assert!(len(1, &[Value::Number(1.0)]).is_err());
        assert!(list(1, &[Value::string("3".to_owned())]).is_err());
    }
}
